use crate::ast::DeclScope;
use std::collections::HashMap;

/// Bijective base-26 encoding of a 1-based counter: 1→"a", 26→"z", 27→"aa".
pub fn gen_id(mut n: usize) -> String {
    let mut out = Vec::new();
    while n > 0 {
        n -= 1;
        out.push(b'a' + (n % 26) as u8);
        n /= 26;
    }
    out.reverse();
    String::from_utf8(out).expect("ascii letters")
}

/// A custom procedure's registered signature and call metadata.
#[derive(Debug, Clone)]
pub struct ProcedureDef {
    pub params: Vec<String>,
    pub arg_ids: Vec<String>,
    pub proccode: String,
    pub warp: bool,
    pub returns: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    LocalVar(String),
    GlobalVar(String),
    LocalList(String, Vec<String>),
    GlobalList(String, Vec<String>),
    NotFound,
}

/// Per-unit symbol tables. The global portions are seeded from the previous
/// unit and exported again after this unit compiles successfully; everything
/// else lives and dies with one compilation pass.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub variables: HashMap<String, String>,
    pub global_variables: HashMap<String, String>,
    pub lists: HashMap<String, (String, Vec<String>)>,
    pub global_lists: HashMap<String, (String, Vec<String>)>,
    pub extensions: Vec<(String, String)>,
    procedures: HashMap<String, ProcedureDef>,
    // shared across units via seeding, so variable ids never collide
    // between a later unit's locals and an earlier unit's globals
    var_counter: usize,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(
        global_variables: HashMap<String, String>,
        global_lists: HashMap<String, (String, Vec<String>)>,
        var_counter: usize,
    ) -> Self {
        Self {
            global_variables,
            global_lists,
            var_counter,
            ..Self::default()
        }
    }

    pub fn var_counter(&self) -> usize {
        self.var_counter
    }

    /// Unsuffixed id off the shared counter (procedure argument ids).
    pub fn next_raw_id(&mut self) -> String {
        self.var_counter += 1;
        gen_id(self.var_counter)
    }

    fn next_var_id(&mut self, name: &str) -> String {
        self.var_counter += 1;
        format!("{}-{}", gen_id(self.var_counter), name)
    }

    pub fn declare_var(&mut self, name: &str, scope: DeclScope) -> String {
        let id = self.next_var_id(name);
        match scope {
            DeclScope::Local => self.variables.insert(name.to_string(), id.clone()),
            DeclScope::Global => self.global_variables.insert(name.to_string(), id.clone()),
        };
        id
    }

    pub fn declare_list(&mut self, name: &str, scope: DeclScope, initial: Vec<String>) -> String {
        let id = self.next_var_id(name);
        match scope {
            DeclScope::Local => self
                .lists
                .insert(name.to_string(), (id.clone(), initial)),
            DeclScope::Global => self
                .global_lists
                .insert(name.to_string(), (id.clone(), initial)),
        };
        id
    }

    /// Strict precedence: local var, global var, local list, global list.
    /// (Procedure parameters shadow all of these, but they live in the code
    /// generator's lexical scope, which is consulted before this table.)
    pub fn resolve(&self, name: &str) -> Resolution {
        if let Some(id) = self.variables.get(name) {
            return Resolution::LocalVar(id.clone());
        }
        if let Some(id) = self.global_variables.get(name) {
            return Resolution::GlobalVar(id.clone());
        }
        if let Some((id, initial)) = self.lists.get(name) {
            return Resolution::LocalList(id.clone(), initial.clone());
        }
        if let Some((id, initial)) = self.global_lists.get(name) {
            return Resolution::GlobalList(id.clone(), initial.clone());
        }
        Resolution::NotFound
    }

    pub fn register_procedure(&mut self, name: &str, def: ProcedureDef) {
        self.procedures.insert(name.to_string(), def);
    }

    pub fn lookup_procedure(&self, name: &str) -> Option<&ProcedureDef> {
        self.procedures.get(name)
    }

    pub fn mark_procedure_returning(&mut self, name: &str) {
        if let Some(def) = self.procedures.get_mut(name) {
            def.returns = true;
        }
    }

    pub fn register_extension(&mut self, source: &str, id: &str) {
        let pair = (source.to_string(), id.to_string());
        if !self.extensions.contains(&pair) {
            self.extensions.push(pair);
        }
    }

    /// The global portions handed to the next compilation unit.
    pub fn export_globals(
        &self,
    ) -> (
        HashMap<String, String>,
        HashMap<String, (String, Vec<String>)>,
    ) {
        (self.global_variables.clone(), self.global_lists.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn gen_id_is_bijective_base26() {
        assert_eq!(gen_id(1), "a");
        assert_eq!(gen_id(26), "z");
        assert_eq!(gen_id(27), "aa");
        assert_eq!(gen_id(52), "az");
        assert_eq!(gen_id(53), "ba");
        assert_eq!(gen_id(702), "zz");
        assert_eq!(gen_id(703), "aaa");
    }

    #[test]
    fn declared_ids_carry_name_suffix() {
        let mut env = Environment::new();
        let id = env.declare_var("score", DeclScope::Local);
        assert_eq!(id, "a-score");
        let id = env.declare_list("names", DeclScope::Global, vec!["x".to_string()]);
        assert_eq!(id, "b-names");
    }

    #[test]
    fn resolution_precedence_local_var_first() {
        let mut env = Environment::new();
        env.declare_list("thing", DeclScope::Global, vec![]);
        env.declare_var("thing", DeclScope::Global);
        env.declare_var("thing", DeclScope::Local);
        assert!(matches!(env.resolve("thing"), Resolution::LocalVar(_)));
    }

    #[test]
    fn globals_survive_seeding() {
        let mut env = Environment::new();
        env.declare_var("score", DeclScope::Global);
        let (vars, lists) = env.export_globals();
        let next = Environment::seeded(vars, lists, env.var_counter());
        assert!(matches!(next.resolve("score"), Resolution::GlobalVar(_)));
        assert_eq!(next.resolve("missing"), Resolution::NotFound);
    }

    #[test]
    fn seeded_counter_avoids_id_reuse() {
        let mut env = Environment::new();
        env.declare_var("a1", DeclScope::Global);
        let (vars, lists) = env.export_globals();
        let mut next = Environment::seeded(vars, lists, env.var_counter());
        let id = next.declare_var("b1", DeclScope::Local);
        assert_eq!(id, "b-b1");
    }

    #[test]
    fn extensions_deduplicate() {
        let mut env = Environment::new();
        env.register_extension("pen", "pen");
        env.register_extension("pen", "pen");
        assert_eq!(env.extensions.len(), 1);
    }
}
