use anyhow::{anyhow, bail, Result};
use serde_json::Value;
use std::collections::HashMap;

/// Catalog-declared classification of an opcode, governing how the code
/// generator links it into the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    Reporter,
    Hat,
    Branch(Vec<String>),
}

/// How a field-typed parameter's name resolves at lowering time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Variable,
    List,
    Broadcast,
    Plain,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamKind {
    Input,
    Field(FieldKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub kind: ParamKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpcodeDef {
    pub params: Vec<Param>,
    pub shape: Shape,
}

impl OpcodeDef {
    pub fn is_hat(&self) -> bool {
        self.shape == Shape::Hat
    }

    pub fn branch_slots(&self) -> &[String] {
        match &self.shape {
            Shape::Branch(slots) => slots,
            _ => &[],
        }
    }
}

/// Injected lookup service mapping instruction names to their parameter lists
/// and shapes. Population is a synchronous precondition of compilation; the
/// only mutation afterwards is incremental merging driven by includes.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    defs: HashMap<String, OpcodeDef>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.merge(builtin_defs());
        catalog
    }

    pub fn lookup(&self, name: &str) -> Option<&OpcodeDef> {
        self.defs.get(name)
    }

    pub fn merge<I>(&mut self, defs: I)
    where
        I: IntoIterator<Item = (String, OpcodeDef)>,
    {
        self.defs.extend(defs);
    }

    /// Merge one of the named opcode sets an include directive can splice in.
    /// Returns false when no set of that name exists.
    pub fn merge_set(&mut self, name: &str) -> bool {
        match named_set(name) {
            Some(defs) => {
                self.merge(defs);
                true
            }
            None => false,
        }
    }

    /// Load additional definitions from an externally-provided JSON document:
    /// `{ "<opcode>": { "params": [{"name": .., "kind": ..}], "shape": .. } }`.
    pub fn merge_json(&mut self, doc: &Value) -> Result<()> {
        let entries = doc
            .as_object()
            .ok_or_else(|| anyhow!("Catalog document must be a JSON object."))?;
        for (opcode, body) in entries {
            let def = parse_def(opcode, body)?;
            self.defs.insert(opcode.clone(), def);
        }
        Ok(())
    }
}

fn parse_def(opcode: &str, body: &Value) -> Result<OpcodeDef> {
    let params = body
        .get("params")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .map(|p| parse_param(opcode, p))
                .collect::<Result<Vec<_>>>()
        })
        .transpose()?
        .unwrap_or_default();
    let shape = match body.get("shape") {
        None => Shape::Reporter,
        Some(Value::String(s)) if s == "reporter" => Shape::Reporter,
        Some(Value::String(s)) if s == "hat" => Shape::Hat,
        Some(Value::Object(map)) => {
            let slots = map
                .get("branch")
                .and_then(Value::as_array)
                .ok_or_else(|| anyhow!("Opcode '{}' has a malformed branch shape.", opcode))?
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| anyhow!("Opcode '{}' has a non-string branch slot.", opcode))
                })
                .collect::<Result<Vec<_>>>()?;
            Shape::Branch(slots)
        }
        Some(other) => bail!("Opcode '{}' has an unknown shape {:?}.", opcode, other),
    };
    Ok(OpcodeDef { params, shape })
}

fn parse_param(opcode: &str, value: &Value) -> Result<Param> {
    let name = value
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("Opcode '{}' has a parameter without a name.", opcode))?;
    let kind = match value.get("kind").and_then(Value::as_str) {
        None | Some("input") => ParamKind::Input,
        Some("variable") => ParamKind::Field(FieldKind::Variable),
        Some("list") => ParamKind::Field(FieldKind::List),
        Some("broadcast") => ParamKind::Field(FieldKind::Broadcast),
        Some("field") => ParamKind::Field(FieldKind::Plain),
        Some(other) => bail!(
            "Opcode '{}' parameter '{}' has unknown kind '{}'.",
            opcode,
            name,
            other
        ),
    };
    Ok(Param {
        name: name.to_string(),
        kind,
    })
}

fn input(name: &str) -> Param {
    Param {
        name: name.to_string(),
        kind: ParamKind::Input,
    }
}

fn field(name: &str, kind: FieldKind) -> Param {
    Param {
        name: name.to_string(),
        kind: ParamKind::Field(kind),
    }
}

fn reporter(params: Vec<Param>) -> OpcodeDef {
    OpcodeDef {
        params,
        shape: Shape::Reporter,
    }
}

fn hat(params: Vec<Param>) -> OpcodeDef {
    OpcodeDef {
        params,
        shape: Shape::Hat,
    }
}

fn branch(params: Vec<Param>, slots: &[&str]) -> OpcodeDef {
    OpcodeDef {
        params,
        shape: Shape::Branch(slots.iter().map(|s| s.to_string()).collect()),
    }
}

fn builtin_defs() -> Vec<(String, OpcodeDef)> {
    let defs: Vec<(&str, OpcodeDef)> = vec![
        // events
        ("event_whenflagclicked", hat(vec![])),
        (
            "event_whenbroadcastreceived",
            hat(vec![field("BROADCAST_OPTION", FieldKind::Broadcast)]),
        ),
        (
            "event_whenkeypressed",
            hat(vec![field("KEY_OPTION", FieldKind::Plain)]),
        ),
        (
            "event_broadcast",
            reporter(vec![input("BROADCAST_INPUT")]),
        ),
        (
            "event_broadcastandwait",
            reporter(vec![input("BROADCAST_INPUT")]),
        ),
        // control
        ("control_if", branch(vec![input("CONDITION")], &["SUBSTACK"])),
        (
            "control_if_else",
            branch(vec![input("CONDITION")], &["SUBSTACK", "SUBSTACK2"]),
        ),
        ("control_repeat", branch(vec![input("TIMES")], &["SUBSTACK"])),
        (
            "control_repeat_until",
            branch(vec![input("CONDITION")], &["SUBSTACK"]),
        ),
        (
            "control_while",
            branch(vec![input("CONDITION")], &["SUBSTACK"]),
        ),
        ("control_forever", branch(vec![], &["SUBSTACK"])),
        (
            "control_for_each",
            branch(
                vec![field("VARIABLE", FieldKind::Variable), input("VALUE")],
                &["SUBSTACK"],
            ),
        ),
        ("control_wait", reporter(vec![input("DURATION")])),
        (
            "control_stop",
            reporter(vec![field("STOP_OPTION", FieldKind::Plain)]),
        ),
        // operators
        ("operator_add", reporter(vec![input("NUM1"), input("NUM2")])),
        (
            "operator_subtract",
            reporter(vec![input("NUM1"), input("NUM2")]),
        ),
        (
            "operator_multiply",
            reporter(vec![input("NUM1"), input("NUM2")]),
        ),
        (
            "operator_divide",
            reporter(vec![input("NUM1"), input("NUM2")]),
        ),
        ("operator_mod", reporter(vec![input("NUM1"), input("NUM2")])),
        (
            "operator_equals",
            reporter(vec![input("OPERAND1"), input("OPERAND2")]),
        ),
        (
            "operator_gt",
            reporter(vec![input("OPERAND1"), input("OPERAND2")]),
        ),
        (
            "operator_lt",
            reporter(vec![input("OPERAND1"), input("OPERAND2")]),
        ),
        (
            "operator_and",
            reporter(vec![input("OPERAND1"), input("OPERAND2")]),
        ),
        (
            "operator_or",
            reporter(vec![input("OPERAND1"), input("OPERAND2")]),
        ),
        ("operator_not", reporter(vec![input("OPERAND")])),
        (
            "operator_join",
            reporter(vec![input("STRING1"), input("STRING2")]),
        ),
        (
            "operator_letter_of",
            reporter(vec![input("LETTER"), input("STRING")]),
        ),
        ("operator_length", reporter(vec![input("STRING")])),
        ("operator_random", reporter(vec![input("FROM"), input("TO")])),
        ("operator_round", reporter(vec![input("NUM")])),
        // data
        (
            "data_setvariableto",
            reporter(vec![field("VARIABLE", FieldKind::Variable), input("VALUE")]),
        ),
        (
            "data_changevariableby",
            reporter(vec![field("VARIABLE", FieldKind::Variable), input("VALUE")]),
        ),
        (
            "data_variable",
            reporter(vec![field("VARIABLE", FieldKind::Variable)]),
        ),
        (
            "data_addtolist",
            reporter(vec![input("ITEM"), field("LIST", FieldKind::List)]),
        ),
        (
            "data_deleteoflist",
            reporter(vec![input("INDEX"), field("LIST", FieldKind::List)]),
        ),
        (
            "data_deletealloflist",
            reporter(vec![field("LIST", FieldKind::List)]),
        ),
        (
            "data_insertatlist",
            reporter(vec![
                input("ITEM"),
                input("INDEX"),
                field("LIST", FieldKind::List),
            ]),
        ),
        (
            "data_replaceitemoflist",
            reporter(vec![
                input("INDEX"),
                field("LIST", FieldKind::List),
                input("ITEM"),
            ]),
        ),
        (
            "data_itemoflist",
            reporter(vec![input("INDEX"), field("LIST", FieldKind::List)]),
        ),
        (
            "data_itemnumoflist",
            reporter(vec![input("ITEM"), field("LIST", FieldKind::List)]),
        ),
        (
            "data_lengthoflist",
            reporter(vec![field("LIST", FieldKind::List)]),
        ),
        (
            "data_listcontainsitem",
            reporter(vec![input("ITEM"), field("LIST", FieldKind::List)]),
        ),
        // looks / sensing / motion statements used from scripts
        ("looks_say", reporter(vec![input("MESSAGE")])),
        (
            "looks_sayforsecs",
            reporter(vec![input("MESSAGE"), input("SECS")]),
        ),
        ("looks_think", reporter(vec![input("MESSAGE")])),
        ("looks_show", reporter(vec![])),
        ("looks_hide", reporter(vec![])),
        ("sensing_answer", reporter(vec![])),
        ("sensing_timer", reporter(vec![])),
        ("sensing_resettimer", reporter(vec![])),
        ("sensing_askandwait", reporter(vec![input("QUESTION")])),
        ("motion_movesteps", reporter(vec![input("STEPS")])),
        ("motion_gotoxy", reporter(vec![input("X"), input("Y")])),
        ("motion_turnright", reporter(vec![input("DEGREES")])),
        ("motion_turnleft", reporter(vec![input("DEGREES")])),
        // procedures
        ("procedures_definition", reporter(vec![input("custom_block")])),
        (
            "procedures_definition_return",
            reporter(vec![input("custom_block")]),
        ),
        ("procedures_prototype", reporter(vec![])),
        ("procedures_call", reporter(vec![])),
        ("procedures_return", reporter(vec![input("return")])),
        (
            "argument_reporter_string_number",
            reporter(vec![field("VALUE", FieldKind::Plain)]),
        ),
    ];
    defs.into_iter()
        .map(|(name, def)| (name.to_string(), def))
        .collect()
}

fn named_set(name: &str) -> Option<Vec<(String, OpcodeDef)>> {
    let defs: Vec<(&str, OpcodeDef)> = match name {
        "pen" => vec![
            ("pen_clear", reporter(vec![])),
            ("pen_stamp", reporter(vec![])),
            ("pen_penDown", reporter(vec![])),
            ("pen_penUp", reporter(vec![])),
            ("pen_setPenColorToColor", reporter(vec![input("COLOR")])),
            ("pen_changePenSizeBy", reporter(vec![input("SIZE")])),
            ("pen_setPenSizeTo", reporter(vec![input("SIZE")])),
        ],
        "json" => vec![(
            "skyhigh173JSON_json_vm_getlist",
            reporter(vec![input("LIST")]),
        )],
        _ => return None,
    };
    Some(
        defs.into_iter()
            .map(|(name, def)| (name.to_string(), def))
            .collect(),
    )
}
