use crate::ast::{LiteralValue, Node, Position};
use crate::environment::{Environment, Resolution};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone)]
pub enum SemanticError {
    NotAnIdentifier {
        pos: Position,
        found: String,
    },
    UnresolvedIdentifier {
        pos: Position,
        name: String,
    },
    UnknownProperty {
        pos: Position,
        property: String,
    },
    UnknownMethod {
        pos: Position,
        method: String,
    },
    MissingArguments {
        pos: Position,
        call: String,
        needs: String,
    },
    BadMacroArgument {
        pos: Position,
        intrinsic: String,
        message: String,
    },
    HostEvalUnsupported {
        pos: Position,
    },
}

impl SemanticError {
    pub fn pos(&self) -> Position {
        match self {
            SemanticError::NotAnIdentifier { pos, .. }
            | SemanticError::UnresolvedIdentifier { pos, .. }
            | SemanticError::UnknownProperty { pos, .. }
            | SemanticError::UnknownMethod { pos, .. }
            | SemanticError::MissingArguments { pos, .. }
            | SemanticError::BadMacroArgument { pos, .. }
            | SemanticError::HostEvalUnsupported { pos } => *pos,
        }
    }
}

impl Display for SemanticError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SemanticError::NotAnIdentifier { found, .. } => {
                write!(f, "Can only access properties of identifiers (got {})", found)
            }
            SemanticError::UnresolvedIdentifier { name, .. } => {
                write!(f, "Could not find variable or list '{}'", name)
            }
            SemanticError::UnknownProperty { property, .. } => {
                write!(f, "Unknown property '{}'", property)
            }
            SemanticError::UnknownMethod { method, .. } => {
                write!(f, "Unknown method '{}'", method)
            }
            SemanticError::MissingArguments { call, needs, .. } => {
                write!(f, "{} requires {}", call, needs)
            }
            SemanticError::BadMacroArgument {
                intrinsic, message, ..
            } => write!(f, "{}: {}", intrinsic, message),
            SemanticError::HostEvalUnsupported { .. } => {
                write!(f, "evaljs is not supported; macros operate on AST values only")
            }
        }
    }
}

impl Error for SemanticError {}

/// Registered macro substitutions: identifier-name -> subtree and
/// call-identifier -> subtree. Lives with one compilation unit so units
/// cannot observe each other's macros.
#[derive(Debug, Clone, Default)]
pub struct MacroTable {
    identifiers: HashMap<String, Node>,
    functions: HashMap<String, Node>,
}

impl MacroTable {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Result of the per-node rewrite step: a (possibly substituted) node to keep
/// lowering, or nothing when the node was a registration consumed here.
#[derive(Debug)]
pub enum Transformed {
    Node(Node),
    Consumed,
}

/// Rewrite sugar nodes into canonical catalog calls. Invoked by the code
/// generator on each node right before it dispatches on the node's kind.
pub fn transform(
    node: Node,
    env: &Environment,
    macros: &mut MacroTable,
) -> Result<Transformed, SemanticError> {
    match node {
        Node::ObjectAccess {
            pos,
            object,
            property,
        } => transform_access(pos, *object, &property, env).map(Transformed::Node),
        Node::ObjectMethodCall {
            pos,
            object,
            method,
            args,
        } => transform_method_call(pos, *object, &method, args, env).map(Transformed::Node),
        Node::FunctionCall { pos, name, args } => transform_call(pos, name, args, macros),
        Node::Identifier { pos, name } => {
            if let Some(subtree) = macros.identifiers.get(&name) {
                return Ok(Transformed::Node(subtree.clone()));
            }
            Ok(Transformed::Node(Node::Identifier { pos, name }))
        }
        Node::OnEvent { pos, event, branch } => Ok(Transformed::Node(Node::BranchFunctionCall {
            pos,
            name: "event_whenbroadcastreceived".to_string(),
            args: vec![text(pos, event)],
            branches: vec![branch],
        })),
        other => Ok(Transformed::Node(other)),
    }
}

fn transform_access(
    pos: Position,
    object: Node,
    property: &str,
    env: &Environment,
) -> Result<Node, SemanticError> {
    let name = identifier_name(&object)?;
    let (list_id, initial) = match env.resolve(name) {
        Resolution::LocalList(id, initial) | Resolution::GlobalList(id, initial) => (id, initial),
        Resolution::LocalVar(_) | Resolution::GlobalVar(_) => {
            return Err(SemanticError::UnknownProperty {
                pos,
                property: property.to_string(),
            });
        }
        Resolution::NotFound => {
            return Err(SemanticError::UnresolvedIdentifier {
                pos,
                name: name.to_string(),
            });
        }
    };
    match property {
        "length" => Ok(call(pos, "data_lengthoflist", vec![text(pos, name)])),
        "json" => Ok(call(
            pos,
            "skyhigh173JSON_json_vm_getlist",
            vec![text(pos, name)],
        )),
        // folds to compile-time literals recorded at declaration
        "initial_json" => Ok(text(
            pos,
            serde_json::to_string(&initial).unwrap_or_else(|_| "[]".to_string()),
        )),
        "id" => Ok(text(pos, list_id)),
        "last" => Ok(call(
            pos,
            "data_itemoflist",
            vec![
                call(pos, "data_lengthoflist", vec![text(pos, name)]),
                text(pos, name),
            ],
        )),
        _ => Err(SemanticError::UnknownProperty {
            pos,
            property: property.to_string(),
        }),
    }
}

fn transform_method_call(
    pos: Position,
    object: Node,
    method: &str,
    mut args: Vec<Node>,
    env: &Environment,
) -> Result<Node, SemanticError> {
    // string intrinsics apply to any object
    match method {
        "letter" => {
            let index = take_arg(&mut args, 0, pos, "string::letter()", "a letter index")?;
            return Ok(call(pos, "operator_letter_of", vec![index, object]));
        }
        "str_length" => {
            return Ok(call(pos, "operator_length", vec![object]));
        }
        "join" => {
            let other = take_arg(&mut args, 0, pos, "string::join()", "a second string")?;
            return Ok(call(pos, "operator_join", vec![object, other]));
        }
        _ => {}
    }

    let name = identifier_name(&object)?;
    match env.resolve(name) {
        Resolution::LocalList(..) | Resolution::GlobalList(..) => {}
        Resolution::LocalVar(_) | Resolution::GlobalVar(_) => {
            return Err(SemanticError::UnknownMethod {
                pos,
                method: method.to_string(),
            });
        }
        Resolution::NotFound => {
            return Err(SemanticError::UnresolvedIdentifier {
                pos,
                name: name.to_string(),
            });
        }
    }

    let list = |pos| text(pos, name);
    match method {
        "push" => {
            let item = take_arg(&mut args, 0, pos, "list::push()", "an element to push")?;
            Ok(call(pos, "data_addtolist", vec![item, list(pos)]))
        }
        "replace" => {
            let (index, item) =
                take_two(&mut args, pos, "list::replace()", "an index and an item")?;
            Ok(call(
                pos,
                "data_replaceitemoflist",
                vec![index, list(pos), item],
            ))
        }
        "remove" => {
            let index = take_arg(&mut args, 0, pos, "list::remove()", "an index")?;
            Ok(call(pos, "data_deleteoflist", vec![index, list(pos)]))
        }
        "insert" => {
            let (index, item) = take_two(&mut args, pos, "list::insert()", "an index and an item")?;
            Ok(call(pos, "data_insertatlist", vec![item, index, list(pos)]))
        }
        "clear" => Ok(call(pos, "data_deletealloflist", vec![list(pos)])),
        "at" => {
            let index = take_arg(&mut args, 0, pos, "list::at()", "an index")?;
            Ok(call(pos, "data_itemoflist", vec![index, list(pos)]))
        }
        "indexof" => {
            let item = take_arg(&mut args, 0, pos, "list::indexof()", "an item")?;
            Ok(call(pos, "data_itemnumoflist", vec![item, list(pos)]))
        }
        "contains" => {
            let item = take_arg(&mut args, 0, pos, "list::contains()", "an item")?;
            Ok(call(pos, "data_listcontainsitem", vec![item, list(pos)]))
        }
        _ => Err(SemanticError::UnknownMethod {
            pos,
            method: method.to_string(),
        }),
    }
}

fn transform_call(
    pos: Position,
    name: String,
    mut args: Vec<Node>,
    macros: &mut MacroTable,
) -> Result<Transformed, SemanticError> {
    if let Some(subtree) = macros.functions.get(&name) {
        return Ok(Transformed::Node(subtree.clone()));
    }
    match name.as_str() {
        "evaljs" => Err(SemanticError::HostEvalUnsupported { pos }),
        "identifier_redefine" | "func_redefine" => {
            if args.len() < 2 {
                return Err(SemanticError::BadMacroArgument {
                    pos,
                    intrinsic: name,
                    message: "expected a target identifier and a substitute expression"
                        .to_string(),
                });
            }
            let substitute = args.remove(1);
            let target = args.remove(0);
            let Node::Identifier { name: target, .. } = target else {
                return Err(SemanticError::BadMacroArgument {
                    pos,
                    intrinsic: name,
                    message: "argument 1 must be an identifier".to_string(),
                });
            };
            if name == "identifier_redefine" {
                macros.identifiers.insert(target, substitute);
            } else {
                macros.functions.insert(target, substitute);
            }
            Ok(Transformed::Consumed)
        }
        _ => Ok(Transformed::Node(Node::FunctionCall { pos, name, args })),
    }
}

fn identifier_name(object: &Node) -> Result<&str, SemanticError> {
    match object {
        Node::Identifier { name, .. } => Ok(name),
        other => Err(SemanticError::NotAnIdentifier {
            pos: other.pos(),
            found: kind_label(other).to_string(),
        }),
    }
}

fn take_arg(
    args: &mut Vec<Node>,
    index: usize,
    pos: Position,
    call: &str,
    needs: &str,
) -> Result<Node, SemanticError> {
    if args.len() <= index {
        return Err(SemanticError::MissingArguments {
            pos,
            call: call.to_string(),
            needs: needs.to_string(),
        });
    }
    Ok(args.remove(index))
}

fn take_two(
    args: &mut Vec<Node>,
    pos: Position,
    call: &str,
    needs: &str,
) -> Result<(Node, Node), SemanticError> {
    if args.len() < 2 {
        return Err(SemanticError::MissingArguments {
            pos,
            call: call.to_string(),
            needs: needs.to_string(),
        });
    }
    let second = args.remove(1);
    let first = args.remove(0);
    Ok((first, second))
}

fn call(pos: Position, name: &str, args: Vec<Node>) -> Node {
    Node::FunctionCall {
        pos,
        name: name.to_string(),
        args,
    }
}

fn text(pos: Position, value: impl Into<String>) -> Node {
    Node::Literal {
        pos,
        value: LiteralValue::Text(value.into()),
    }
}

fn kind_label(node: &Node) -> &'static str {
    match node {
        Node::VariableDeclaration { .. } => "VariableDeclaration",
        Node::ListDeclaration { .. } => "ListDeclaration",
        Node::FunctionDeclaration { .. } => "FunctionDeclaration",
        Node::Assignment { .. } => "Assignment",
        Node::BinaryExpression { .. } => "BinaryExpression",
        Node::Not { .. } => "Not",
        Node::Literal { .. } => "Literal",
        Node::Identifier { .. } => "Identifier",
        Node::FunctionCall { .. } => "FunctionCall",
        Node::BranchFunctionCall { .. } => "BranchFunctionCall",
        Node::If { .. } => "If",
        Node::For { .. } => "For",
        Node::GreenFlag { .. } => "GreenFlag",
        Node::Boolean { .. } => "Boolean",
        Node::Include { .. } => "Include",
        Node::Return { .. } => "Return",
        Node::ObjectAccess { .. } => "ObjectAccess",
        Node::ObjectMethodCall { .. } => "ObjectMethodCall",
        Node::OnEvent { .. } => "OnEvent",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::DeclScope;
    use pretty_assertions::assert_eq;

    fn pos() -> Position {
        Position::new(1, 1)
    }

    fn env_with_list() -> Environment {
        let mut env = Environment::new();
        env.declare_list(
            "inventory",
            DeclScope::Local,
            vec!["sword".to_string(), "shield".to_string()],
        );
        env
    }

    fn ident(name: &str) -> Node {
        Node::Identifier {
            pos: pos(),
            name: name.to_string(),
        }
    }

    fn expect_node(result: Transformed) -> Node {
        match result {
            Transformed::Node(node) => node,
            Transformed::Consumed => panic!("expected a node"),
        }
    }

    #[test]
    fn list_length_becomes_catalog_call() {
        let env = env_with_list();
        let mut macros = MacroTable::new();
        let node = Node::ObjectAccess {
            pos: pos(),
            object: Box::new(ident("inventory")),
            property: "length".to_string(),
        };
        let out = expect_node(transform(node, &env, &mut macros).unwrap());
        let Node::FunctionCall { name, args, .. } = out else {
            panic!("expected call");
        };
        assert_eq!(name, "data_lengthoflist");
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn initial_json_folds_to_literal() {
        let env = env_with_list();
        let mut macros = MacroTable::new();
        let node = Node::ObjectAccess {
            pos: pos(),
            object: Box::new(ident("inventory")),
            property: "initial_json".to_string(),
        };
        let out = expect_node(transform(node, &env, &mut macros).unwrap());
        let Node::Literal {
            value: LiteralValue::Text(text),
            ..
        } = out
        else {
            panic!("expected literal");
        };
        assert_eq!(text, "[\"sword\",\"shield\"]");
    }

    #[test]
    fn last_property_nests_length_call() {
        let env = env_with_list();
        let mut macros = MacroTable::new();
        let node = Node::ObjectAccess {
            pos: pos(),
            object: Box::new(ident("inventory")),
            property: "last".to_string(),
        };
        let out = expect_node(transform(node, &env, &mut macros).unwrap());
        let Node::FunctionCall { name, args, .. } = out else {
            panic!("expected call");
        };
        assert_eq!(name, "data_itemoflist");
        assert!(matches!(
            &args[0],
            Node::FunctionCall { name, .. } if name == "data_lengthoflist"
        ));
    }

    #[test]
    fn property_on_variable_is_an_error() {
        let mut env = Environment::new();
        env.declare_var("x", DeclScope::Local);
        let mut macros = MacroTable::new();
        let node = Node::ObjectAccess {
            pos: pos(),
            object: Box::new(ident("x")),
            property: "length".to_string(),
        };
        let err = transform(node, &env, &mut macros).unwrap_err();
        assert!(matches!(err, SemanticError::UnknownProperty { .. }));
    }

    #[test]
    fn push_requires_an_argument() {
        let env = env_with_list();
        let mut macros = MacroTable::new();
        let node = Node::ObjectMethodCall {
            pos: pos(),
            object: Box::new(ident("inventory")),
            method: "push".to_string(),
            args: vec![],
        };
        let err = transform(node, &env, &mut macros).unwrap_err();
        let SemanticError::MissingArguments { call, .. } = err else {
            panic!("expected missing-arguments error");
        };
        assert_eq!(call, "list::push()");
    }

    #[test]
    fn insert_swaps_index_and_item() {
        let env = env_with_list();
        let mut macros = MacroTable::new();
        let node = Node::ObjectMethodCall {
            pos: pos(),
            object: Box::new(ident("inventory")),
            method: "insert".to_string(),
            args: vec![
                Node::Literal {
                    pos: pos(),
                    value: LiteralValue::Number(3.0),
                },
                Node::Literal {
                    pos: pos(),
                    value: LiteralValue::Text("axe".to_string()),
                },
            ],
        };
        let out = expect_node(transform(node, &env, &mut macros).unwrap());
        let Node::FunctionCall { name, args, .. } = out else {
            panic!("expected call");
        };
        assert_eq!(name, "data_insertatlist");
        // argument order is (item, index, list)
        assert!(matches!(
            &args[0],
            Node::Literal { value: LiteralValue::Text(t), .. } if t == "axe"
        ));
    }

    #[test]
    fn string_intrinsics_apply_to_any_object() {
        let env = Environment::new();
        let mut macros = MacroTable::new();
        let node = Node::ObjectMethodCall {
            pos: pos(),
            object: Box::new(Node::Literal {
                pos: pos(),
                value: LiteralValue::Text("hello".to_string()),
            }),
            method: "str_length".to_string(),
            args: vec![],
        };
        let out = expect_node(transform(node, &env, &mut macros).unwrap());
        assert!(matches!(
            out,
            Node::FunctionCall { name, .. } if name == "operator_length"
        ));
    }

    #[test]
    fn macro_registration_then_substitution() {
        let env = Environment::new();
        let mut macros = MacroTable::new();
        let register = Node::FunctionCall {
            pos: pos(),
            name: "identifier_redefine".to_string(),
            args: vec![
                ident("answer"),
                Node::Literal {
                    pos: pos(),
                    value: LiteralValue::Number(42.0),
                },
            ],
        };
        assert!(matches!(
            transform(register, &env, &mut macros).unwrap(),
            Transformed::Consumed
        ));
        let out = expect_node(transform(ident("answer"), &env, &mut macros).unwrap());
        assert!(matches!(
            out,
            Node::Literal {
                value: LiteralValue::Number(n),
                ..
            } if n == 42.0
        ));
    }

    #[test]
    fn evaljs_is_refused() {
        let env = Environment::new();
        let mut macros = MacroTable::new();
        let node = Node::FunctionCall {
            pos: pos(),
            name: "evaljs".to_string(),
            args: vec![],
        };
        assert!(matches!(
            transform(node, &env, &mut macros).unwrap_err(),
            SemanticError::HostEvalUnsupported { .. }
        ));
    }

    #[test]
    fn on_event_desugars_to_branch_call() {
        let env = Environment::new();
        let mut macros = MacroTable::new();
        let node = Node::OnEvent {
            pos: pos(),
            event: "ping".to_string(),
            branch: vec![],
        };
        let out = expect_node(transform(node, &env, &mut macros).unwrap());
        let Node::BranchFunctionCall { name, branches, .. } = out else {
            panic!("expected branch call");
        };
        assert_eq!(name, "event_whenbroadcastreceived");
        assert_eq!(branches.len(), 1);
    }
}
