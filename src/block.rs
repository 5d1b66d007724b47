use crate::ast::format_number;
use serde_json::{json, Map, Value};

const INPUT_NUMBER: u8 = 4;
const INPUT_TEXT: u8 = 10;
const INPUT_BROADCAST: u8 = 11;
const INPUT_VARIABLE: u8 = 12;
const INPUT_LIST: u8 = 13;

/// One encoded input slot: a literal, a reference to a nested block, a
/// named runtime resource, or the head of a nested statement chain.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Number(f64),
    Text(String),
    Block(String),
    ShadowBlock(String),
    Variable { name: String, id: String },
    List { name: String, id: String },
    Broadcast { name: String, id: String },
    Substack(String),
}

impl Input {
    pub fn to_json(&self) -> Value {
        match self {
            Input::Number(n) => json!([1, [INPUT_NUMBER, format_number(*n)]]),
            Input::Text(s) => json!([1, [INPUT_TEXT, s]]),
            Input::Block(id) => json!([2, id]),
            Input::ShadowBlock(id) => json!([1, id]),
            Input::Variable { name, id } => json!([2, [INPUT_VARIABLE, name, id]]),
            Input::List { name, id } => json!([2, [INPUT_LIST, name, id]]),
            Input::Broadcast { name, id } => json!([1, [INPUT_BROADCAST, name, id]]),
            Input::Substack(id) => json!([2, id]),
        }
    }

    /// Id of the block this input points at, if it is a block reference.
    pub fn referenced_block(&self) -> Option<&str> {
        match self {
            Input::Block(id) | Input::ShadowBlock(id) | Input::Substack(id) => Some(id),
            _ => None,
        }
    }
}

/// Field tuple: display value plus the optional id of the named resource.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldValue {
    pub value: String,
    pub id: Option<String>,
}

impl FieldValue {
    pub fn plain(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            id: None,
        }
    }

    pub fn with_id(value: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            id: Some(id.into()),
        }
    }

    pub fn to_json(&self) -> Value {
        json!([self.value, self.id])
    }
}

/// Procedure signature metadata carried on prototype and call blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub proccode: String,
    pub argument_ids: Vec<String>,
    pub argument_names: Option<Vec<String>>,
    pub warp: bool,
    pub returns: Option<bool>,
}

impl Mutation {
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("tagName".to_string(), json!("mutation"));
        map.insert("children".to_string(), json!([]));
        map.insert("proccode".to_string(), json!(self.proccode));
        map.insert(
            "argumentids".to_string(),
            json!(serde_json::to_string(&self.argument_ids).unwrap_or_default()),
        );
        if let Some(names) = &self.argument_names {
            map.insert(
                "argumentnames".to_string(),
                json!(serde_json::to_string(names).unwrap_or_default()),
            );
            map.insert(
                "argumentdefaults".to_string(),
                json!(serde_json::to_string(&vec![""; names.len()]).unwrap_or_default()),
            );
        }
        map.insert(
            "warp".to_string(),
            json!(if self.warp { "true" } else { "false" }),
        );
        if let Some(returns) = self.returns {
            map.insert(
                "returns".to_string(),
                json!(if returns { "true" } else { "false" }),
            );
        }
        Value::Object(map)
    }
}

/// One emitted instruction node. Ids are assigned at creation and never
/// change; `opcode`, `next`, and `mutation` may be rewritten in place while
/// the block keeps its identity.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: String,
    pub opcode: String,
    pub inputs: Vec<(String, Input)>,
    pub fields: Vec<(String, FieldValue)>,
    pub parent: Option<String>,
    pub next: Option<String>,
    pub top_level: bool,
    pub shadow: bool,
    pub x: Option<i64>,
    pub y: Option<i64>,
    pub mutation: Option<Mutation>,
}

impl Block {
    pub fn new(id: impl Into<String>, opcode: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            opcode: opcode.into(),
            inputs: Vec::new(),
            fields: Vec::new(),
            parent: None,
            next: None,
            top_level: false,
            shadow: false,
            x: None,
            y: None,
            mutation: None,
        }
    }

    pub fn set_input(&mut self, name: impl Into<String>, input: Input) {
        let name = name.into();
        if let Some(slot) = self.inputs.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = input;
        } else {
            self.inputs.push((name, input));
        }
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: FieldValue) {
        let name = name.into();
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.fields.push((name, value));
        }
    }

    /// JSON record keyed by id in the emitted block map; x/y only appear on
    /// top-level blocks.
    pub fn to_json(&self) -> Value {
        let mut inputs = Map::new();
        for (name, input) in &self.inputs {
            inputs.insert(name.clone(), input.to_json());
        }
        let mut fields = Map::new();
        for (name, value) in &self.fields {
            fields.insert(name.clone(), value.to_json());
        }
        let mut map = Map::new();
        map.insert("opcode".to_string(), json!(self.opcode));
        map.insert("next".to_string(), json!(self.next));
        map.insert("parent".to_string(), json!(self.parent));
        map.insert("inputs".to_string(), Value::Object(inputs));
        map.insert("fields".to_string(), Value::Object(fields));
        map.insert("shadow".to_string(), json!(self.shadow));
        map.insert("topLevel".to_string(), json!(self.top_level));
        if self.top_level {
            map.insert("x".to_string(), json!(self.x.unwrap_or(0)));
            map.insert("y".to_string(), json!(self.y.unwrap_or(0)));
        }
        if let Some(mutation) = &self.mutation {
            map.insert("mutation".to_string(), mutation.to_json());
        }
        Value::Object(map)
    }
}

/// Intermediate per-node output: the node's primary block (absent for
/// side-effect-only nodes) plus the collections of the operand blocks emitted
/// while lowering it.
#[derive(Debug, Clone, Default)]
pub struct BlockCollection {
    pub block: Option<Block>,
    pub children: Vec<BlockCollection>,
}

impl BlockCollection {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn leaf(block: Block) -> Self {
        Self {
            block: Some(block),
            children: Vec::new(),
        }
    }

    pub fn with_children(block: Block, children: Vec<BlockCollection>) -> Self {
        Self {
            block: Some(block),
            children,
        }
    }

    pub fn primary_id(&self) -> Option<&str> {
        self.block.as_ref().map(|b| b.id.as_str())
    }

    /// Pre-order flattening: primary block first, then each child's sequence.
    /// The order carries no runtime meaning (blocks reconnect purely by id)
    /// but stays deterministic for reproducible output.
    pub fn flatten(self) -> Vec<Block> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into(self, out: &mut Vec<Block>) {
        if let Some(block) = self.block {
            out.push(block);
        }
        for child in self.children {
            child.flatten_into(out);
        }
    }
}
