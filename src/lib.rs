pub mod ast;
pub mod block;
pub mod catalog;
pub mod cli;
pub mod codegen;
pub mod environment;
pub mod imports;
pub mod lexer;
pub mod parser;
pub mod project;
pub mod transform;

use anyhow::Result;
use ast::Position;
use block::Block;
use catalog::Catalog;
use codegen::GenError;
use imports::{resolve_merged_source, MergedSource};
use project::{compile_project, CompiledProject, UnitSource};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;

/// Failure of any stage of the pipeline, with its source position.
#[derive(Debug)]
pub enum CompileError {
    Lex(lexer::LexerError),
    Parse(parser::ParseError),
    Generation(GenError),
}

impl CompileError {
    pub fn kind(&self) -> &'static str {
        match self {
            CompileError::Lex(_) => "Lex error",
            CompileError::Parse(_) => "Parse error",
            CompileError::Generation(GenError::Semantic(_)) => "Semantic error",
            CompileError::Generation(_) => "Generation error",
        }
    }

    pub fn pos(&self) -> Position {
        match self {
            CompileError::Lex(e) => e.pos,
            CompileError::Parse(e) => e.pos,
            CompileError::Generation(e) => e.pos(),
        }
    }

    pub fn message(&self) -> String {
        match self {
            CompileError::Lex(e) => e.message.clone(),
            CompileError::Parse(e) => e.message.clone(),
            CompileError::Generation(e) => e.to_string(),
        }
    }
}

impl Display for CompileError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let pos = self.pos();
        write!(
            f,
            "{}: {} (line {}, column {})",
            self.kind(),
            self.message(),
            pos.line,
            pos.column
        )
    }
}

impl Error for CompileError {}

/// Structured failure report: error kind, message, position, and a caret-
/// marked window of the surrounding source lines.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: &'static str,
    pub message: String,
    pub line: usize,
    pub column: usize,
    pub snippet: String,
}

impl Diagnostic {
    pub fn from_error(error: &CompileError, source: &str) -> Self {
        let pos = error.pos();
        Self {
            kind: error.kind(),
            message: error.message(),
            line: pos.line,
            column: pos.column,
            snippet: render_snippet(source, pos.line, pos.column),
        }
    }
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} (line {}, column {})",
            self.kind, self.message, self.line, self.column
        )?;
        if !self.snippet.is_empty() {
            write!(f, "\n{}", self.snippet)?;
        }
        Ok(())
    }
}

fn render_snippet(source: &str, line: usize, column: usize) -> String {
    let lines: Vec<&str> = source.lines().collect();
    if lines.is_empty() || line == 0 {
        return String::new();
    }
    let at = (line - 1).min(lines.len() - 1);
    let start = at.saturating_sub(2);
    let end = (at + 2).min(lines.len() - 1);
    let width = (end + 1).to_string().len();
    let mut out = Vec::new();
    for index in start..=end {
        out.push(format!("{:>width$} | {}", index + 1, lines[index]));
        if index == at {
            out.push(format!(
                "{:>width$} | {}^",
                "",
                " ".repeat(column.saturating_sub(1)),
            ));
        }
    }
    out.join("\n")
}

/// Compile one unit of source text against a populated catalog.
pub fn compile_source(source: &str, catalog: &mut Catalog) -> Result<Vec<Block>> {
    let env = environment::Environment::new();
    match project::compile_unit_source(source, catalog, env) {
        Ok((blocks, _)) => Ok(blocks),
        Err(error) => Err(anyhow::anyhow!(
            "{}",
            Diagnostic::from_error(&error, source)
        )),
    }
}

/// Compile a whole project; unit failures are rendered with their source
/// context and unit name.
pub fn compile_units(catalog: &mut Catalog, units: Vec<UnitSource>) -> Result<CompiledProject> {
    compile_project(catalog, units).map_err(|failure| {
        anyhow::anyhow!(
            "error in '{}'\n{}",
            failure.unit,
            Diagnostic::from_error(&failure.error, &failure.source)
        )
    })
}

pub fn run_cli(args: &cli::Args) -> Result<()> {
    let mut catalog = Catalog::builtin();
    if let Some(path) = &args.catalog {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read catalog '{}': {}", path.display(), e))?;
        let doc: serde_json::Value = serde_json::from_str(&text)?;
        catalog.merge_json(&doc)?;
    }

    let mut units = Vec::new();
    let mut merged_sources: HashMap<String, MergedSource> = HashMap::new();
    for (index, input) in args.inputs.iter().enumerate() {
        let name = unit_name(input);
        let merged = resolve_merged_source(input)?;
        let is_stage = match &args.stage {
            Some(stage) => name == *stage,
            None => index == 0,
        };
        units.push(UnitSource {
            name: name.clone(),
            is_stage,
            source: merged.source.clone(),
        });
        merged_sources.insert(name, merged);
    }
    if let Some(stage) = &args.stage {
        if !units.iter().any(|u| u.is_stage) {
            anyhow::bail!("No input named '{}' to use as the stage.", stage);
        }
    }

    let compiled = match compile_project(&mut catalog, units) {
        Ok(compiled) => compiled,
        Err(failure) => {
            let diagnostic = Diagnostic::from_error(&failure.error, &failure.source);
            // map the merged-line position back to the originating file
            if let Some(merged) = merged_sources.get(&failure.unit) {
                let mapped = merged.map_position(diagnostic.line, diagnostic.column);
                anyhow::bail!(
                    "error in '{}' (file '{}', line {}, column {})\n{}",
                    failure.unit,
                    mapped.file.display(),
                    mapped.line,
                    mapped.column,
                    diagnostic
                );
            }
            anyhow::bail!("error in '{}'\n{}", failure.unit, diagnostic);
        }
    };

    let doc = compiled.to_json();
    let text = serde_json::to_string_pretty(&doc)?;
    match &args.output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, text)?;
        }
        None => println!("{}", text),
    }
    Ok(())
}

fn unit_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn diagnostic_renders_caret_snippet() {
        let source = indoc! {r#"
            gf {
              say(
            }
        "#};
        let mut catalog = Catalog::builtin();
        let err = compile_source(source, &mut catalog).unwrap_err();
        let text = format!("{}", err);
        assert!(text.starts_with("Parse error:"), "got: {}", text);
        assert!(text.contains("2 |   say("));
        assert!(text.contains("^"));
    }

    #[test]
    fn semantic_errors_keep_their_kind() {
        let mut catalog = Catalog::builtin();
        let err = compile_source("gf { missing::push(1) }", &mut catalog).unwrap_err();
        assert!(format!("{}", err).starts_with("Semantic error:"));
    }

    #[test]
    fn compile_source_reports_generation_kind() {
        let mut catalog = Catalog::builtin();
        let err = compile_source("gf { foo() }", &mut catalog).unwrap_err();
        let text = format!("{}", err);
        assert!(text.starts_with("Generation error:"), "got: {}", text);
        assert!(text.contains("Unknown opcode \"foo\""));
    }

    #[test]
    fn snippet_window_clamps_at_edges() {
        let snippet = render_snippet("only line", 1, 3);
        assert_eq!(snippet, "1 | only line\n  |   ^");
    }
}
