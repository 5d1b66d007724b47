use crate::ast::{DeclScope, LiteralValue, Node, Position};
use crate::block::{Block, BlockCollection, FieldValue, Input, Mutation};
use crate::catalog::{Catalog, FieldKind, OpcodeDef, ParamKind};
use crate::environment::{gen_id, Environment, ProcedureDef, Resolution};
use crate::transform::{transform, MacroTable, SemanticError, Transformed};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone)]
pub enum GenError {
    UnknownOpcode {
        pos: Position,
        name: String,
    },
    UnknownVariable {
        pos: Position,
        name: String,
    },
    InvalidPlacement {
        pos: Position,
        message: String,
    },
    TooManyBranches {
        pos: Position,
        opcode: String,
        expected: usize,
        got: usize,
    },
    UnknownIncludeSet {
        pos: Position,
        name: String,
    },
    Semantic(SemanticError),
}

impl GenError {
    pub fn pos(&self) -> Position {
        match self {
            GenError::UnknownOpcode { pos, .. }
            | GenError::UnknownVariable { pos, .. }
            | GenError::InvalidPlacement { pos, .. }
            | GenError::TooManyBranches { pos, .. }
            | GenError::UnknownIncludeSet { pos, .. } => *pos,
            GenError::Semantic(inner) => inner.pos(),
        }
    }
}

impl Display for GenError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            GenError::UnknownOpcode { name, .. } => write!(f, "Unknown opcode \"{}\"", name),
            GenError::UnknownVariable { name, .. } => {
                write!(f, "Unknown variable or list '{}'", name)
            }
            GenError::InvalidPlacement { message, .. } => write!(f, "{}", message),
            GenError::TooManyBranches {
                opcode,
                expected,
                got,
                ..
            } => write!(
                f,
                "Opcode '{}' takes at most {} branches, got {}",
                opcode, expected, got
            ),
            GenError::UnknownIncludeSet { name, .. } => {
                write!(f, "Unknown include set '{}'", name)
            }
            GenError::Semantic(inner) => inner.fmt(f),
        }
    }
}

impl Error for GenError {}

impl From<SemanticError> for GenError {
    fn from(inner: SemanticError) -> Self {
        GenError::Semantic(inner)
    }
}

/// A procedure parameter binding: a factory producing the parameter's
/// reporter block under a freshly allocated id.
#[derive(Debug, Clone)]
struct ParamBinding {
    param: String,
}

impl ParamBinding {
    fn materialize(&self, id: String, parent: &str) -> Block {
        let mut block = Block::new(id, "argument_reporter_string_number");
        block.parent = Some(parent.to_string());
        block.set_field("VALUE", FieldValue::plain(self.param.clone()));
        block
    }
}

/// Lexical chain of parameter bindings, duplicated (never shared) when
/// entering a nested procedure so local additions cannot leak upward.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    bindings: HashMap<String, ParamBinding>,
}

impl Scope {
    fn child(&self) -> Scope {
        self.clone()
    }

    fn bind(&mut self, param: String) {
        self.bindings.insert(param.clone(), ParamBinding { param });
    }

    fn get(&self, name: &str) -> Option<&ParamBinding> {
        self.bindings.get(name)
    }
}

/// Owning handle to the definition/prototype pair of the procedure whose body
/// is currently being lowered; `return` rewrites both in place.
#[derive(Debug)]
struct OpenProcedure {
    definition: Block,
    prototype: Block,
    name: String,
}

/// Lowers a transformed AST into the block graph, one instance per
/// compilation unit. Owns the unit's block-id counter and threads the
/// statement cursor through sequence lowering.
pub struct Generator<'a> {
    catalog: &'a mut Catalog,
    pub env: Environment,
    macros: MacroTable,
    block_counter: usize,
    open_proc: Option<OpenProcedure>,
}

impl<'a> Generator<'a> {
    pub fn new(catalog: &'a mut Catalog, env: Environment) -> Self {
        Self {
            catalog,
            env,
            macros: MacroTable::new(),
            block_counter: 0,
            open_proc: None,
        }
    }

    pub fn into_environment(self) -> Environment {
        self.env
    }

    /// Compile a whole program. Phase 1 pre-registers every top-level
    /// procedure signature so declarations can reference each other in any
    /// order; phase 2 lowers the nodes.
    pub fn generate_program(&mut self, nodes: Vec<Node>) -> Result<Vec<Block>, GenError> {
        for node in &nodes {
            if let Node::FunctionDeclaration {
                name, params, warp, ..
            } = node
            {
                self.register_signature(name, params, *warp);
            }
        }
        let scope = Scope::default();
        let mut blocks = Vec::new();
        let mut y_cursor: i64 = 30;
        for node in nodes {
            let mut collection = self.lower_statement(node, None, true, &scope)?;
            if let Some(block) = collection.block.as_mut() {
                if block.top_level {
                    block.x = Some(30);
                    block.y = Some(y_cursor);
                    y_cursor += 120;
                }
            }
            blocks.extend(collection.flatten());
        }
        Ok(blocks)
    }

    fn register_signature(&mut self, name: &str, params: &[String], warp: bool) {
        let arg_ids = params.iter().map(|_| self.env.next_raw_id()).collect();
        let placeholders = params.iter().map(|_| "%s").collect::<Vec<_>>().join(" ");
        let proccode = if placeholders.is_empty() {
            name.to_string()
        } else {
            format!("{} {}", name, placeholders)
        };
        self.env.register_procedure(
            name,
            ProcedureDef {
                params: params.to_vec(),
                arg_ids,
                proccode,
                warp,
                returns: false,
            },
        );
    }

    fn new_block_id(&mut self) -> String {
        self.block_counter += 1;
        gen_id(self.block_counter)
    }

    /// Lower a statement sequence into a linked chain: each emitted primary
    /// block gets the previous primary as parent and is wired into its
    /// `next`. Side-effect-only nodes contribute nothing and do not break
    /// the chain. Returns the collections plus the head block id.
    fn lower_sequence(
        &mut self,
        nodes: Vec<Node>,
        parent: Option<&str>,
        scope: &Scope,
    ) -> Result<(Vec<BlockCollection>, Option<String>), GenError> {
        let mut collections: Vec<BlockCollection> = Vec::new();
        let mut first: Option<String> = None;
        let mut prev: Option<usize> = None;
        for node in nodes {
            let chain_parent = match prev {
                Some(i) => collections[i].primary_id().map(str::to_string),
                None => parent.map(str::to_string),
            };
            let collection = self.lower_statement(node, chain_parent.as_deref(), false, scope)?;
            if let Some(id) = collection.primary_id().map(str::to_string) {
                if let Some(i) = prev {
                    if let Some(prev_block) = collections[i].block.as_mut() {
                        prev_block.next = Some(id.clone());
                    }
                }
                if first.is_none() {
                    first = Some(id);
                }
                prev = Some(collections.len());
            }
            collections.push(collection);
        }
        Ok((collections, first))
    }

    fn lower_statement(
        &mut self,
        node: Node,
        parent: Option<&str>,
        top_level: bool,
        scope: &Scope,
    ) -> Result<BlockCollection, GenError> {
        let node = match transform(node, &self.env, &mut self.macros)? {
            Transformed::Node(node) => node,
            Transformed::Consumed => return Ok(BlockCollection::empty()),
        };
        match node {
            Node::GreenFlag { body, .. } => {
                let id = self.new_block_id();
                let mut entry = Block::new(&id, "event_whenflagclicked");
                entry.top_level = true;
                let (children, head) = self.lower_sequence(body, Some(&id), scope)?;
                entry.next = head;
                Ok(BlockCollection::with_children(entry, children))
            }
            Node::Include { pos, kind, path } => {
                self.lower_include(pos, &kind, &path)?;
                Ok(BlockCollection::empty())
            }
            Node::VariableDeclaration {
                pos,
                name,
                value,
                scope: decl_scope,
            } => {
                let var_id = self.env.declare_var(&name, decl_scope);
                self.lower_set_variable(pos, name, var_id, *value, parent, top_level, scope)
            }
            Node::Assignment { pos, name, value } => {
                let var_id = match self.env.resolve(&name) {
                    Resolution::LocalVar(id) | Resolution::GlobalVar(id) => id,
                    _ => return Err(GenError::UnknownVariable { pos, name }),
                };
                self.lower_set_variable(pos, name, var_id, *value, parent, top_level, scope)
            }
            Node::ListDeclaration {
                pos,
                name,
                items,
                scope: decl_scope,
            } => {
                let mut initial = Vec::new();
                for item in items {
                    initial.push(list_initializer_text(&item, pos)?);
                }
                self.env.declare_list(&name, decl_scope, initial);
                Ok(BlockCollection::empty())
            }
            Node::FunctionDeclaration {
                name,
                params,
                warp,
                body,
                ..
            } => self.lower_function_declaration(name, params, warp, body, scope),
            Node::Return { pos, value } => {
                if self.open_proc.is_none() {
                    return Err(GenError::InvalidPlacement {
                        pos,
                        message: "'return' outside of a procedure body".to_string(),
                    });
                }
                let id = self.new_block_id();
                let mut block = Block::new(&id, "procedures_return");
                block.parent = parent.map(str::to_string);
                block.top_level = top_level;
                let (input, children) = self.lower_operand(*value, &id, scope)?;
                block.set_input("return", input);
                let open = self.open_proc.as_mut().expect("open procedure");
                open.definition.opcode = "procedures_definition_return".to_string();
                if let Some(mutation) = open.prototype.mutation.as_mut() {
                    mutation.returns = Some(true);
                }
                let proc_name = open.name.clone();
                self.env.mark_procedure_returning(&proc_name);
                Ok(BlockCollection::with_children(block, children))
            }
            Node::If {
                condition,
                then_branch,
                else_branch,
                ..
            } => {
                let id = self.new_block_id();
                let opcode = if else_branch.is_some() {
                    "control_if_else"
                } else {
                    "control_if"
                };
                let mut block = Block::new(&id, opcode);
                block.parent = parent.map(str::to_string);
                block.top_level = top_level;
                let (cond, mut children) = self.lower_operand(*condition, &id, scope)?;
                block.set_input("CONDITION", cond);
                let (then_cols, then_head) = self.lower_sequence(then_branch, Some(&id), scope)?;
                if let Some(head) = then_head {
                    block.set_input("SUBSTACK", Input::Substack(head));
                }
                children.extend(then_cols);
                if let Some(else_body) = else_branch {
                    let (else_cols, else_head) = self.lower_sequence(else_body, Some(&id), scope)?;
                    if let Some(head) = else_head {
                        block.set_input("SUBSTACK2", Input::Substack(head));
                    }
                    children.extend(else_cols);
                }
                Ok(BlockCollection::with_children(block, children))
            }
            Node::For {
                pos,
                binder,
                times,
                body,
            } => {
                let Node::Identifier { name, .. } = *binder else {
                    return Err(GenError::InvalidPlacement {
                        pos,
                        message: "'for' binder must be an identifier".to_string(),
                    });
                };
                let var_id = match self.env.resolve(&name) {
                    Resolution::LocalVar(id) | Resolution::GlobalVar(id) => id,
                    // a fresh binder becomes a unit-local variable
                    _ => self.env.declare_var(&name, DeclScope::Local),
                };
                let id = self.new_block_id();
                let mut block = Block::new(&id, "control_for_each");
                block.parent = parent.map(str::to_string);
                block.top_level = top_level;
                block.set_field("VARIABLE", FieldValue::with_id(name, var_id));
                let (times_input, mut children) = self.lower_operand(*times, &id, scope)?;
                block.set_input("VALUE", times_input);
                let (body_cols, body_head) = self.lower_sequence(body, Some(&id), scope)?;
                if let Some(head) = body_head {
                    block.set_input("SUBSTACK", Input::Substack(head));
                }
                children.extend(body_cols);
                Ok(BlockCollection::with_children(block, children))
            }
            Node::FunctionCall { pos, name, args } => {
                self.lower_call(pos, &name, args, parent, top_level, scope)
            }
            Node::BranchFunctionCall {
                pos,
                name,
                args,
                branches,
            } => self.lower_branch_call(pos, &name, args, branches, parent, top_level, scope),
            node @ (Node::Boolean { .. } | Node::Not { .. } | Node::BinaryExpression { .. }) => {
                self.lower_reporter(node, parent, scope)
            }
            Node::Literal { .. } | Node::Identifier { .. } => Ok(BlockCollection::empty()),
            Node::ObjectAccess { .. } | Node::ObjectMethodCall { .. } | Node::OnEvent { .. } => {
                unreachable!("rewritten before dispatch")
            }
        }
    }

    fn lower_include(&mut self, pos: Position, kind: &str, path: &str) -> Result<(), GenError> {
        if kind == "extension" {
            let id = extension_stem(path);
            self.env.register_extension(path, &id);
            // an extension may also ship opcode definitions under its id
            self.catalog.merge_set(&id);
            return Ok(());
        }
        if !self.catalog.merge_set(path) {
            return Err(GenError::UnknownIncludeSet {
                pos,
                name: path.to_string(),
            });
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn lower_set_variable(
        &mut self,
        _pos: Position,
        name: String,
        var_id: String,
        value: Node,
        parent: Option<&str>,
        top_level: bool,
        scope: &Scope,
    ) -> Result<BlockCollection, GenError> {
        let id = self.new_block_id();
        let mut block = Block::new(&id, "data_setvariableto");
        block.parent = parent.map(str::to_string);
        block.top_level = top_level;
        block.set_field("VARIABLE", FieldValue::with_id(name, var_id));
        let (input, children) = self.lower_operand(value, &id, scope)?;
        block.set_input("VALUE", input);
        Ok(BlockCollection::with_children(block, children))
    }

    fn lower_function_declaration(
        &mut self,
        name: String,
        params: Vec<String>,
        warp: bool,
        body: Vec<Node>,
        scope: &Scope,
    ) -> Result<BlockCollection, GenError> {
        if self.env.lookup_procedure(&name).is_none() {
            self.register_signature(&name, &params, warp);
        }
        let def = self
            .env
            .lookup_procedure(&name)
            .cloned()
            .expect("registered signature");

        let def_id = self.new_block_id();
        let proto_id = self.new_block_id();
        let mut definition = Block::new(&def_id, "procedures_definition");
        definition.top_level = true;
        definition.set_input("custom_block", Input::ShadowBlock(proto_id.clone()));

        let mut prototype = Block::new(&proto_id, "procedures_prototype");
        prototype.parent = Some(def_id.clone());
        prototype.shadow = true;
        prototype.mutation = Some(Mutation {
            proccode: def.proccode.clone(),
            argument_ids: def.arg_ids.clone(),
            argument_names: Some(def.params.clone()),
            warp: def.warp,
            returns: None,
        });

        let mut child_scope = scope.child();
        let mut shadows = Vec::new();
        for (param, arg_id) in def.params.iter().zip(def.arg_ids.iter()) {
            let shadow_id = self.new_block_id();
            let mut shadow = Block::new(&shadow_id, "argument_reporter_string_number");
            shadow.parent = Some(proto_id.clone());
            shadow.shadow = true;
            shadow.set_field("VALUE", FieldValue::plain(param.clone()));
            prototype.set_input(arg_id.clone(), Input::ShadowBlock(shadow_id));
            child_scope.bind(param.clone());
            shadows.push(BlockCollection::leaf(shadow));
        }

        // the open-procedure handle lets `return` rewrite the pair in place
        let outer = self.open_proc.replace(OpenProcedure {
            definition,
            prototype,
            name,
        });
        let result = self.lower_sequence(body, Some(&def_id), &child_scope);
        let open = self.open_proc.take().expect("open procedure");
        self.open_proc = outer;
        let (body_cols, body_head) = result?;

        let OpenProcedure {
            mut definition,
            prototype,
            ..
        } = open;
        definition.next = body_head;
        let mut children = vec![BlockCollection::leaf(prototype)];
        children.extend(shadows);
        children.extend(body_cols);
        Ok(BlockCollection::with_children(definition, children))
    }

    #[allow(clippy::too_many_arguments)]
    fn lower_call(
        &mut self,
        pos: Position,
        name: &str,
        args: Vec<Node>,
        parent: Option<&str>,
        top_level: bool,
        scope: &Scope,
    ) -> Result<BlockCollection, GenError> {
        let id = self.new_block_id();

        if let Some(def) = self.env.lookup_procedure(name).cloned() {
            let mut block = Block::new(&id, "procedures_call");
            block.parent = parent.map(str::to_string);
            block.top_level = top_level;
            block.mutation = Some(Mutation {
                proccode: def.proccode.clone(),
                argument_ids: def.arg_ids.clone(),
                argument_names: None,
                warp: def.warp,
                returns: if def.returns { Some(true) } else { None },
            });
            let mut children = Vec::new();
            let supplied = def.arg_ids.len().min(args.len());
            for (arg, arg_id) in args.into_iter().take(supplied).zip(def.arg_ids.iter()) {
                let (input, kids) = self.lower_operand(arg, &id, scope)?;
                block.set_input(arg_id.clone(), input);
                children.extend(kids);
            }
            return Ok(BlockCollection::with_children(block, children));
        }

        let Some(def) = self.catalog.lookup(name).cloned() else {
            return Err(GenError::UnknownOpcode {
                pos,
                name: name.to_string(),
            });
        };
        let mut block = Block::new(&id, name);
        block.parent = parent.map(str::to_string);
        block.top_level = top_level;
        let children = self.apply_arguments(&mut block, &def, args, pos, scope)?;
        Ok(BlockCollection::with_children(block, children))
    }

    /// Bind positional arguments to an opcode's declared parameters: inputs
    /// go through operand lowering, field parameters take a resolved
    /// name/id tuple. Extra arguments are dropped, missing ones stay unset.
    fn apply_arguments(
        &mut self,
        block: &mut Block,
        def: &OpcodeDef,
        args: Vec<Node>,
        pos: Position,
        scope: &Scope,
    ) -> Result<Vec<BlockCollection>, GenError> {
        let mut children = Vec::new();
        let block_id = block.id.clone();
        let mut args = args.into_iter();
        for param in &def.params {
            let Some(arg) = args.next() else {
                break;
            };
            match &param.kind {
                ParamKind::Field(kind) => {
                    let field = self.field_value(arg, *kind, pos)?;
                    block.set_field(param.name.clone(), field);
                }
                ParamKind::Input => {
                    let (input, kids) = self.lower_operand(arg, &block_id, scope)?;
                    block.set_input(param.name.clone(), input);
                    children.extend(kids);
                }
            }
        }
        Ok(children)
    }

    fn field_value(
        &mut self,
        arg: Node,
        kind: FieldKind,
        pos: Position,
    ) -> Result<FieldValue, GenError> {
        let name = match arg {
            Node::Literal { value, .. } => value.as_text(),
            Node::Identifier { name, .. } => name,
            other => {
                return Err(GenError::InvalidPlacement {
                    pos: other.pos(),
                    message: "field arguments must be names or literals".to_string(),
                });
            }
        };
        match kind {
            FieldKind::Variable => match self.env.resolve(&name) {
                Resolution::LocalVar(id) | Resolution::GlobalVar(id) => {
                    Ok(FieldValue::with_id(name, id))
                }
                _ => Err(GenError::UnknownVariable { pos, name }),
            },
            FieldKind::List => match self.env.resolve(&name) {
                Resolution::LocalList(id, _) | Resolution::GlobalList(id, _) => {
                    Ok(FieldValue::with_id(name, id))
                }
                _ => Err(GenError::UnknownVariable { pos, name }),
            },
            FieldKind::Broadcast => Ok(FieldValue::with_id(name.clone(), name)),
            FieldKind::Plain => Ok(FieldValue::plain(name)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn lower_branch_call(
        &mut self,
        pos: Position,
        name: &str,
        args: Vec<Node>,
        branches: Vec<Vec<Node>>,
        parent: Option<&str>,
        top_level: bool,
        scope: &Scope,
    ) -> Result<BlockCollection, GenError> {
        let Some(def) = self.catalog.lookup(name).cloned() else {
            return Err(GenError::UnknownOpcode {
                pos,
                name: name.to_string(),
            });
        };

        if def.is_hat() {
            if !top_level {
                return Err(GenError::InvalidPlacement {
                    pos,
                    message: format!("Hat opcode '{}' may only appear at top level", name),
                });
            }
            if branches.len() != 1 {
                return Err(GenError::InvalidPlacement {
                    pos,
                    message: format!(
                        "Hat opcode '{}' takes exactly one branch, got {}",
                        name,
                        branches.len()
                    ),
                });
            }
            let id = self.new_block_id();
            let mut block = Block::new(&id, name);
            block.top_level = true;
            let mut children = self.apply_arguments(&mut block, &def, args, pos, scope)?;
            let branch = branches.into_iter().next().expect("one branch");
            // hats chain forward like the program entry, not via a substack
            let (branch_cols, head) = self.lower_sequence(branch, Some(&id), scope)?;
            block.next = head;
            children.extend(branch_cols);
            return Ok(BlockCollection::with_children(block, children));
        }

        let slots = def.branch_slots().to_vec();
        if branches.len() > slots.len() {
            return Err(GenError::TooManyBranches {
                pos,
                opcode: name.to_string(),
                expected: slots.len(),
                got: branches.len(),
            });
        }
        let id = self.new_block_id();
        let mut block = Block::new(&id, name);
        block.parent = parent.map(str::to_string);
        block.top_level = top_level;
        let mut children = self.apply_arguments(&mut block, &def, args, pos, scope)?;
        for (branch, slot) in branches.into_iter().zip(slots.iter()) {
            let (branch_cols, head) = self.lower_sequence(branch, Some(&id), scope)?;
            if let Some(head) = head {
                block.set_input(slot.clone(), Input::Substack(head));
            }
            children.extend(branch_cols);
        }
        Ok(BlockCollection::with_children(block, children))
    }

    /// Lower an operand into an input encoding: nested expressions become
    /// referenced sub-blocks, identifiers resolve to parameter reporters or
    /// variable/list reference tuples, anything else is a literal.
    fn lower_operand(
        &mut self,
        node: Node,
        parent_id: &str,
        scope: &Scope,
    ) -> Result<(Input, Vec<BlockCollection>), GenError> {
        let pos = node.pos();
        let node = match transform(node, &self.env, &mut self.macros)? {
            Transformed::Node(node) => node,
            Transformed::Consumed => {
                return Err(GenError::InvalidPlacement {
                    pos,
                    message: "macro registration cannot be used as a value".to_string(),
                });
            }
        };
        if node.is_reporter_expr() {
            let collection = self.lower_reporter(node, Some(parent_id), scope)?;
            let id = collection
                .primary_id()
                .expect("reporter collection has a primary block")
                .to_string();
            return Ok((Input::Block(id), vec![collection]));
        }
        match node {
            Node::Identifier { pos, name } => {
                if let Some(binding) = scope.get(&name) {
                    let reporter_id = self.new_block_id();
                    let block = binding.materialize(reporter_id, parent_id);
                    let id = block.id.clone();
                    return Ok((Input::Block(id), vec![BlockCollection::leaf(block)]));
                }
                match self.env.resolve(&name) {
                    Resolution::LocalVar(id) | Resolution::GlobalVar(id) => {
                        Ok((Input::Variable { name, id }, Vec::new()))
                    }
                    Resolution::LocalList(id, _) | Resolution::GlobalList(id, _) => {
                        Ok((Input::List { name, id }, Vec::new()))
                    }
                    Resolution::NotFound => Err(GenError::UnknownVariable { pos, name }),
                }
            }
            Node::Literal { value, .. } => match value {
                LiteralValue::Number(n) => Ok((Input::Number(n), Vec::new())),
                LiteralValue::Text(s) => Ok((Input::Text(s), Vec::new())),
            },
            other => Err(GenError::InvalidPlacement {
                pos: other.pos(),
                message: "expression cannot be used as an input here".to_string(),
            }),
        }
    }

    fn lower_reporter(
        &mut self,
        node: Node,
        parent: Option<&str>,
        scope: &Scope,
    ) -> Result<BlockCollection, GenError> {
        match node {
            Node::FunctionCall { pos, name, args } => {
                self.lower_call(pos, &name, args, parent, false, scope)
            }
            Node::BinaryExpression {
                pos,
                op,
                left,
                right,
            } => self.lower_binary(pos, &op, *left, *right, parent, scope),
            Node::Not { pos, body } => {
                let id = self.new_block_id();
                let mut block = Block::new(&id, "operator_not");
                block.parent = parent.map(str::to_string);
                let (input, children) = self.lower_operand(*body, &id, scope)?;
                block.set_input(self.operand_slot("operator_not", 0, pos)?, input);
                Ok(BlockCollection::with_children(block, children))
            }
            // boolean literals reuse the NOT and AND operator opcodes; an
            // empty NOT reports true, an empty AND reports false
            Node::Boolean { value, .. } => {
                let id = self.new_block_id();
                let opcode = if value { "operator_not" } else { "operator_and" };
                let mut block = Block::new(&id, opcode);
                block.parent = parent.map(str::to_string);
                Ok(BlockCollection::leaf(block))
            }
            other => Err(GenError::InvalidPlacement {
                pos: other.pos(),
                message: "expression cannot be lowered to a reporter block".to_string(),
            }),
        }
    }

    fn lower_binary(
        &mut self,
        pos: Position,
        op: &str,
        left: Node,
        right: Node,
        parent: Option<&str>,
        scope: &Scope,
    ) -> Result<BlockCollection, GenError> {
        // negated comparisons lower to a NOT wrapped around the inverse
        // comparison; both blocks share the surrounding parent context
        if let Some(inner_opcode) = match op {
            "!=" => Some("operator_equals"),
            "<=" => Some("operator_gt"),
            ">=" => Some("operator_lt"),
            _ => None,
        } {
            let outer_id = self.new_block_id();
            let mut outer = Block::new(&outer_id, "operator_not");
            outer.parent = parent.map(str::to_string);

            let inner_id = self.new_block_id();
            let mut inner = Block::new(&inner_id, inner_opcode);
            inner.parent = parent.map(str::to_string);
            let (left_input, mut inner_children) = self.lower_operand(left, &inner_id, scope)?;
            let (right_input, right_children) = self.lower_operand(right, &inner_id, scope)?;
            inner.set_input(self.operand_slot(inner_opcode, 0, pos)?, left_input);
            inner.set_input(self.operand_slot(inner_opcode, 1, pos)?, right_input);
            inner_children.extend(right_children);

            outer.set_input(
                self.operand_slot("operator_not", 0, pos)?,
                Input::Block(inner_id),
            );
            return Ok(BlockCollection::with_children(
                outer,
                vec![BlockCollection::with_children(inner, inner_children)],
            ));
        }

        let opcode = match op {
            "+" => "operator_add",
            "-" => "operator_subtract",
            "*" => "operator_multiply",
            "/" => "operator_divide",
            "%" => "operator_mod",
            "<" => "operator_lt",
            ">" => "operator_gt",
            "=" => "operator_equals",
            "&" => "operator_and",
            "|" => "operator_or",
            other => {
                return Err(GenError::UnknownOpcode {
                    pos,
                    name: other.to_string(),
                });
            }
        };
        let id = self.new_block_id();
        let mut block = Block::new(&id, opcode);
        block.parent = parent.map(str::to_string);
        let (left_input, mut children) = self.lower_operand(left, &id, scope)?;
        let (right_input, right_children) = self.lower_operand(right, &id, scope)?;
        block.set_input(self.operand_slot(opcode, 0, pos)?, left_input);
        block.set_input(self.operand_slot(opcode, 1, pos)?, right_input);
        children.extend(right_children);
        Ok(BlockCollection::with_children(block, children))
    }

    /// Input slot name of an operator opcode's n-th declared parameter.
    fn operand_slot(&self, opcode: &str, index: usize, pos: Position) -> Result<String, GenError> {
        let def = self
            .catalog
            .lookup(opcode)
            .ok_or_else(|| GenError::UnknownOpcode {
                pos,
                name: opcode.to_string(),
            })?;
        def.params
            .get(index)
            .map(|p| p.name.clone())
            .ok_or_else(|| GenError::UnknownOpcode {
                pos,
                name: opcode.to_string(),
            })
    }
}

fn list_initializer_text(node: &Node, pos: Position) -> Result<String, GenError> {
    match node {
        Node::Literal { value, .. } => Ok(value.as_text()),
        Node::Boolean { value, .. } => Ok(if *value { "true" } else { "false" }.to_string()),
        _ => Err(GenError::InvalidPlacement {
            pos,
            message: "list initializers must be literals".to_string(),
        }),
    }
}

/// Short id for an extension source: the stem of the last path segment, so
/// both `pen` and `https://host/ext/pen.js` register as `pen`.
fn extension_stem(source: &str) -> String {
    let segment = source.rsplit('/').next().unwrap_or(source);
    segment
        .split('.')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(segment)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::parser::Parser;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashSet;

    fn test_catalog() -> Catalog {
        let mut catalog = Catalog::builtin();
        catalog
            .merge_json(&json!({
                "say": {"params": [{"name": "MESSAGE"}]}
            }))
            .unwrap();
        catalog
    }

    fn compile(source: &str) -> Vec<Block> {
        try_compile(source).expect("compile failure")
    }

    fn try_compile(source: &str) -> Result<Vec<Block>, GenError> {
        let tokens = Lexer::new(source).tokenize().expect("lex failure");
        let nodes = Parser::new(tokens).parse_program().expect("parse failure");
        let mut catalog = test_catalog();
        let mut generator = Generator::new(&mut catalog, Environment::new());
        generator.generate_program(nodes)
    }

    fn find<'b>(blocks: &'b [Block], opcode: &str) -> &'b Block {
        blocks
            .iter()
            .find(|b| b.opcode == opcode)
            .unwrap_or_else(|| panic!("no block with opcode {}", opcode))
    }

    fn assert_graph_integrity(blocks: &[Block]) {
        let mut ids = HashSet::new();
        for block in blocks {
            assert!(ids.insert(block.id.clone()), "duplicate id {}", block.id);
        }
        for block in blocks {
            for id in block.parent.iter().chain(block.next.iter()) {
                assert!(ids.contains(id), "dangling link {} on {}", id, block.id);
            }
            for (name, input) in &block.inputs {
                if let Some(id) = input.referenced_block() {
                    assert!(
                        ids.contains(id),
                        "dangling input {} -> {} on {}",
                        name,
                        id,
                        block.id
                    );
                }
            }
        }
    }

    #[test]
    fn entry_block_chains_to_say() {
        let blocks = compile("gf { say(\"hi\") }");
        assert_eq!(blocks.len(), 2);
        let entry = find(&blocks, "event_whenflagclicked");
        let say = find(&blocks, "say");
        assert_eq!(entry.next.as_deref(), Some(say.id.as_str()));
        assert_eq!(say.parent.as_deref(), Some(entry.id.as_str()));
        assert_eq!(say.inputs[0].1, Input::Text("hi".to_string()));
        assert!(entry.top_level);
        assert_graph_integrity(&blocks);
    }

    #[test]
    fn statement_chain_links_by_next() {
        let blocks = compile("gf { say(\"a\") say(\"b\") say(\"c\") }");
        let entry = find(&blocks, "event_whenflagclicked");
        let mut cursor = entry.next.clone();
        let mut texts = Vec::new();
        while let Some(id) = cursor {
            let block = blocks.iter().find(|b| b.id == id).unwrap();
            if let Some((_, Input::Text(text))) = block.inputs.first() {
                texts.push(text.clone());
            }
            cursor = block.next.clone();
        }
        assert_eq!(texts, vec!["a", "b", "c"]);
        assert_graph_integrity(&blocks);
    }

    #[test]
    fn not_equals_lowers_to_two_chained_blocks() {
        let blocks = compile("var a = 1 var b = 2 var c = a != b");
        let operators: Vec<&Block> = blocks
            .iter()
            .filter(|b| b.opcode.starts_with("operator_"))
            .collect();
        assert_eq!(operators.len(), 2);
        let outer = find(&blocks, "operator_not");
        let inner = find(&blocks, "operator_equals");
        assert_eq!(
            outer.inputs[0].1,
            Input::Block(inner.id.clone()),
            "NOT must reference the inner comparison"
        );
        let (_, left) = &inner.inputs[0];
        assert!(matches!(left, Input::Variable { name, .. } if name == "a"));
        assert_graph_integrity(&blocks);
    }

    #[test]
    fn lte_inverts_gt() {
        let blocks = compile("var a = 1 var c = a <= 5");
        find(&blocks, "operator_not");
        find(&blocks, "operator_gt");
        assert_graph_integrity(&blocks);
    }

    #[test]
    fn boolean_literals_reuse_operator_opcodes() {
        let blocks = compile("var t = true var f = false");
        let t_set = blocks
            .iter()
            .find(|b| b.fields.iter().any(|(_, v)| v.value == "t"))
            .unwrap();
        let (_, value) = &t_set.inputs[0];
        let Input::Block(id) = value else {
            panic!("expected block input");
        };
        assert_eq!(blocks.iter().find(|b| &b.id == id).unwrap().opcode, "operator_not");
        find(&blocks, "operator_and");
    }

    #[test]
    fn unknown_opcode_is_a_generation_error() {
        let err = try_compile("gf { foo(1) }").unwrap_err();
        let GenError::UnknownOpcode { name, .. } = err else {
            panic!("expected UnknownOpcode, got {:?}", err);
        };
        assert_eq!(name, "foo");
    }

    #[test]
    fn assignment_requires_declaration() {
        let err = try_compile("gf { x = 1 }").unwrap_err();
        assert!(matches!(err, GenError::UnknownVariable { name, .. } if name == "x"));
    }

    #[test]
    fn forward_references_between_procedures() {
        let blocks = compile("fn a() { b() } fn b() { }");
        let call = find(&blocks, "procedures_call");
        assert_eq!(
            call.mutation.as_ref().unwrap().proccode,
            "b".to_string()
        );
        assert_graph_integrity(&blocks);
    }

    #[test]
    fn parameter_shadows_local_variable() {
        let blocks = compile("var x = 1 fn f(x) { say(x) } gf { say(x) }");
        let says: Vec<&Block> = blocks.iter().filter(|b| b.opcode == "say").collect();
        assert_eq!(says.len(), 2);
        let in_proc = says
            .iter()
            .find(|b| matches!(&b.inputs[0].1, Input::Block(_)))
            .expect("procedure body say uses a reporter block");
        let Input::Block(reporter_id) = &in_proc.inputs[0].1 else {
            unreachable!();
        };
        let reporter = blocks.iter().find(|b| &b.id == reporter_id).unwrap();
        assert_eq!(reporter.opcode, "argument_reporter_string_number");
        assert!(!reporter.shadow);
        // outside the procedure the same name is a plain variable reference
        assert!(says
            .iter()
            .any(|b| matches!(&b.inputs[0].1, Input::Variable { name, .. } if name == "x")));
        assert_graph_integrity(&blocks);
    }

    #[test]
    fn procedure_emits_definition_prototype_and_shadows() {
        let blocks = compile("warp fn f(a, b) { say(a) }");
        let definition = find(&blocks, "procedures_definition");
        let prototype = find(&blocks, "procedures_prototype");
        assert_eq!(prototype.parent.as_deref(), Some(definition.id.as_str()));
        assert!(prototype.shadow);
        let mutation = prototype.mutation.as_ref().unwrap();
        assert_eq!(mutation.proccode, "f %s %s");
        assert!(mutation.warp);
        let shadows = blocks
            .iter()
            .filter(|b| b.opcode == "argument_reporter_string_number" && b.shadow)
            .count();
        assert_eq!(shadows, 2);
        assert_graph_integrity(&blocks);
    }

    #[test]
    fn return_rewrites_open_procedure() {
        let blocks = compile("fn f() { return operator_add(1, 2) }");
        let definition = find(&blocks, "procedures_definition_return");
        assert!(definition.next.is_some());
        let prototype = find(&blocks, "procedures_prototype");
        assert_eq!(prototype.mutation.as_ref().unwrap().returns, Some(true));
        find(&blocks, "procedures_return");
        assert_graph_integrity(&blocks);
    }

    #[test]
    fn return_outside_procedure_is_invalid() {
        let err = try_compile("gf { return say(1) }").unwrap_err();
        assert!(matches!(err, GenError::InvalidPlacement { .. }));
    }

    #[test]
    fn if_else_substacks() {
        let blocks = compile("gf { if (1 == 1) { say(\"t\") } else { say(\"f\") } }");
        let branch = find(&blocks, "control_if_else");
        let slots: Vec<&str> = branch.inputs.iter().map(|(n, _)| n.as_str()).collect();
        assert!(slots.contains(&"CONDITION"));
        assert!(slots.contains(&"SUBSTACK"));
        assert!(slots.contains(&"SUBSTACK2"));
        assert_graph_integrity(&blocks);
    }

    #[test]
    fn for_loop_declares_binder_and_substack() {
        let blocks = compile("gf { for (i of 10) { say(i) } }");
        let each = find(&blocks, "control_for_each");
        assert_eq!(each.fields[0].0, "VARIABLE");
        assert!(each.fields[0].1.id.is_some());
        assert!(each.inputs.iter().any(|(n, _)| n == "SUBSTACK"));
        assert_graph_integrity(&blocks);
    }

    #[test]
    fn branch_call_fills_declared_slots() {
        let blocks = compile("gf { control_repeat(4) { say(\"x\") } }");
        let repeat = find(&blocks, "control_repeat");
        assert!(repeat.inputs.iter().any(|(n, _)| n == "TIMES"));
        assert!(repeat.inputs.iter().any(|(n, _)| n == "SUBSTACK"));
        assert_graph_integrity(&blocks);
    }

    #[test]
    fn too_many_branches_is_reported() {
        let err = try_compile("gf { control_repeat(4) { } { } }").unwrap_err();
        assert!(matches!(
            err,
            GenError::TooManyBranches { expected: 1, got: 2, .. }
        ));
    }

    #[test]
    fn hat_outside_top_level_is_invalid_placement() {
        let err = try_compile("gf { event_whenbroadcastreceived(\"go\") { say(\"x\") } }")
            .unwrap_err();
        assert!(matches!(err, GenError::InvalidPlacement { .. }));
    }

    #[test]
    fn hat_at_top_level_chains_forward() {
        let blocks = compile("event_whenbroadcastreceived(\"go\") { say(\"x\") }");
        let hat = find(&blocks, "event_whenbroadcastreceived");
        assert!(hat.top_level);
        assert!(hat.inputs.is_empty(), "hats wire next, not substacks");
        let say = find(&blocks, "say");
        assert_eq!(hat.next.as_deref(), Some(say.id.as_str()));
        assert_eq!(hat.fields[0].1.value, "go");
        assert_graph_integrity(&blocks);
    }

    #[test]
    fn list_method_goes_through_catalog_fields() {
        let blocks = compile("list inv = {\"sword\"} gf { inv::push(\"axe\") }");
        let add = find(&blocks, "data_addtolist");
        assert!(add.inputs.iter().any(|(n, _)| n == "ITEM"));
        let (name, field) = &add.fields[0];
        assert_eq!(name, "LIST");
        assert_eq!(field.value, "inv");
        assert_eq!(field.id.as_deref(), Some("a-inv"));
        assert_graph_integrity(&blocks);
    }

    #[test]
    fn include_merges_extension_opcodes() {
        let blocks = compile("#include <\"extension\" \"pen\"> gf { pen_penDown() }");
        find(&blocks, "pen_penDown");
    }

    #[test]
    fn unknown_include_set_errors() {
        let err = try_compile("#include <\"blocks\" \"nope\">").unwrap_err();
        assert!(matches!(err, GenError::UnknownIncludeSet { .. }));
    }

    #[test]
    fn block_ids_are_base26_and_unique() {
        let blocks = compile("gf { say(\"a\") say(\"b\") }");
        let ids: Vec<&str> = blocks.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
