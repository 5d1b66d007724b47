use crate::block::Block;
use crate::catalog::Catalog;
use crate::codegen::Generator;
use crate::environment::Environment;
use crate::lexer::Lexer;
use crate::parser::Parser;
use crate::CompileError;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// One compilation unit's post-splice source text.
#[derive(Debug, Clone)]
pub struct UnitSource {
    pub name: String,
    pub is_stage: bool,
    pub source: String,
}

/// A unit's emitted block set plus the symbol tables it contributed.
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    pub name: String,
    pub is_stage: bool,
    pub blocks: Vec<Block>,
    pub variables: HashMap<String, String>,
    pub lists: HashMap<String, (String, Vec<String>)>,
    pub extensions: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct CompiledProject {
    pub units: Vec<CompiledUnit>,
    pub global_variables: HashMap<String, String>,
    pub global_lists: HashMap<String, (String, Vec<String>)>,
    pub extensions: Vec<(String, String)>,
}

/// A unit failure, carrying the unit's name and source so callers can render
/// a full diagnostic.
#[derive(Debug)]
pub struct ProjectError {
    pub unit: String,
    pub source: String,
    pub error: CompileError,
}

impl std::fmt::Display for ProjectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "error in '{}': {}", self.unit, self.error)
    }
}

impl std::error::Error for ProjectError {}

/// Compile every unit, stage first, carrying the global symbol tables
/// forward as a strict hand-off: a unit only sees globals declared by units
/// compiled before it, and a failed unit exports nothing.
pub fn compile_project(
    catalog: &mut Catalog,
    units: Vec<UnitSource>,
) -> Result<CompiledProject, ProjectError> {
    let mut ordered = units;
    ordered.sort_by_key(|unit| !unit.is_stage);

    let mut global_variables: HashMap<String, String> = HashMap::new();
    let mut global_lists: HashMap<String, (String, Vec<String>)> = HashMap::new();
    let mut var_counter = 0usize;
    let mut extensions: Vec<(String, String)> = Vec::new();
    let mut compiled = Vec::new();

    for unit in ordered {
        let env = Environment::seeded(global_variables.clone(), global_lists.clone(), var_counter);
        let (blocks, env) = match compile_unit_source(&unit.source, catalog, env) {
            Ok(out) => out,
            Err(error) => {
                return Err(ProjectError {
                    unit: unit.name,
                    source: unit.source,
                    error,
                });
            }
        };
        // finalized globals are exported only after the unit succeeds
        let (vars, lists) = env.export_globals();
        global_variables = vars;
        global_lists = lists;
        var_counter = env.var_counter();
        for ext in &env.extensions {
            if !extensions.contains(ext) {
                extensions.push(ext.clone());
            }
        }
        compiled.push(CompiledUnit {
            name: unit.name,
            is_stage: unit.is_stage,
            blocks,
            variables: env.variables.clone(),
            lists: env.lists.clone(),
            extensions: env.extensions.clone(),
        });
    }

    Ok(CompiledProject {
        units: compiled,
        global_variables,
        global_lists,
        extensions,
    })
}

/// Single-unit pipeline: lex, parse, lower. The environment comes in seeded
/// with the previous unit's globals and is handed back for export.
pub fn compile_unit_source(
    source: &str,
    catalog: &mut Catalog,
    env: Environment,
) -> Result<(Vec<Block>, Environment), CompileError> {
    let tokens = Lexer::new(source).tokenize().map_err(CompileError::Lex)?;
    let nodes = Parser::new(tokens)
        .parse_program()
        .map_err(CompileError::Parse)?;
    let mut generator = Generator::new(catalog, env);
    let blocks = generator
        .generate_program(nodes)
        .map_err(CompileError::Generation)?;
    Ok((blocks, generator.into_environment()))
}

impl CompiledProject {
    /// Emitted graph as JSON, one target record per unit. Globals land on
    /// the stage target the way downstream packagers expect.
    pub fn to_json(&self) -> Value {
        let mut targets = Vec::new();
        for unit in &self.units {
            let mut variables = Map::new();
            for (name, id) in sorted(&unit.variables) {
                variables.insert(id.clone(), json!([name, 0]));
            }
            let mut lists = Map::new();
            for (name, (id, initial)) in sorted(&unit.lists) {
                lists.insert(id.clone(), json!([name, initial]));
            }
            if unit.is_stage {
                for (name, id) in sorted(&self.global_variables) {
                    variables.insert(id.clone(), json!([name, 0]));
                }
                for (name, (id, initial)) in sorted(&self.global_lists) {
                    lists.insert(id.clone(), json!([name, initial]));
                }
            }
            let mut blocks = Map::new();
            for block in &unit.blocks {
                blocks.insert(block.id.clone(), block.to_json());
            }
            targets.push(json!({
                "name": unit.name,
                "isStage": unit.is_stage,
                "variables": variables,
                "lists": lists,
                "blocks": blocks,
            }));
        }
        let extension_ids: Vec<&str> = self.extensions.iter().map(|(_, id)| id.as_str()).collect();
        let extension_urls: Map<String, Value> = self
            .extensions
            .iter()
            .filter(|(source, _)| source.starts_with("http") || source.starts_with("data"))
            .map(|(source, id)| (id.clone(), json!(source)))
            .collect();
        json!({
            "targets": targets,
            "extensions": extension_ids,
            "extensionURLs": extension_urls,
        })
    }
}

fn sorted<V>(map: &HashMap<String, V>) -> Vec<(&String, &V)> {
    let mut entries: Vec<(&String, &V)> = map.iter().collect();
    entries.sort_by_key(|(name, _)| name.as_str());
    entries
}
