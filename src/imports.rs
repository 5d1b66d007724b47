use anyhow::{bail, Result};
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Where a merged line came from, for mapping diagnostics back to the file
/// the user actually wrote.
#[derive(Debug, Clone)]
pub struct SourceLineOrigin {
    pub file: PathBuf,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub struct MappedPosition {
    pub file: PathBuf,
    pub line: usize,
    pub column: usize,
}

/// A unit's source after `.include "path"` lines have been spliced in,
/// with a per-line origin map.
#[derive(Debug, Clone)]
pub struct MergedSource {
    pub source: String,
    pub line_origins: Vec<SourceLineOrigin>,
    entry_file: PathBuf,
}

impl MergedSource {
    pub fn from_text(source: impl Into<String>, entry_file: impl Into<PathBuf>) -> Self {
        let source = source.into();
        let entry_file = entry_file.into();
        let line_origins = source
            .lines()
            .enumerate()
            .map(|(index, _)| SourceLineOrigin {
                file: entry_file.clone(),
                line: index + 1,
            })
            .collect();
        Self {
            source,
            line_origins,
            entry_file,
        }
    }

    pub fn entry_file(&self) -> &Path {
        &self.entry_file
    }

    pub fn map_position(&self, merged_line: usize, merged_column: usize) -> MappedPosition {
        if merged_line > 0 && merged_line <= self.line_origins.len() {
            let origin = &self.line_origins[merged_line - 1];
            return MappedPosition {
                file: origin.file.clone(),
                line: origin.line,
                column: merged_column.max(1),
            };
        }
        let (file, line) = match self.line_origins.last() {
            Some(last) => (
                last.file.clone(),
                last.line + merged_line.saturating_sub(self.line_origins.len()),
            ),
            None => (self.entry_file.clone(), merged_line.max(1)),
        };
        MappedPosition {
            file,
            line,
            column: merged_column.max(1),
        }
    }
}

/// Splice `.include "path"` lines into one merged source, tracking which
/// file and line every merged line originated from.
pub fn resolve_merged_source(entry: &Path) -> Result<MergedSource> {
    let canonical_entry = entry
        .canonicalize()
        .map_err(|_| anyhow::anyhow!("Input file not found: '{}'.", entry.display()))?;
    let mut cache: HashMap<PathBuf, ResolvedFile> = HashMap::new();
    let mut stack: Vec<PathBuf> = Vec::new();
    let resolved = resolve_file(&canonical_entry, &mut stack, &mut cache)?;
    let source = if resolved.lines.is_empty() {
        String::new()
    } else {
        let mut out = resolved.lines.join("\n");
        out.push('\n');
        out
    };
    Ok(MergedSource {
        source,
        line_origins: resolved.origins,
        entry_file: canonical_entry,
    })
}

#[derive(Debug, Clone, Default)]
struct ResolvedFile {
    lines: Vec<String>,
    origins: Vec<SourceLineOrigin>,
}

fn resolve_file(
    path: &Path,
    stack: &mut Vec<PathBuf>,
    cache: &mut HashMap<PathBuf, ResolvedFile>,
) -> Result<ResolvedFile> {
    if let Some(hit) = cache.get(path) {
        return Ok(hit.clone());
    }
    if stack.iter().any(|p| p == path) {
        bail!(
            "Include cycle detected: '{}' includes itself transitively.",
            path.display()
        );
    }
    stack.push(path.to_path_buf());

    let text = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Cannot read '{}': {}", path.display(), e))?;
    let directive = Regex::new(r#"^\s*\.include\s*"(.*)"\s*$"#).expect("static regex");
    let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();

    let mut resolved = ResolvedFile::default();
    for (index, line) in text.lines().enumerate() {
        if let Some(captures) = directive.captures(line) {
            let rel = captures.get(1).expect("capture group").as_str();
            let target = base_dir.join(rel);
            let target = target.canonicalize().map_err(|_| {
                anyhow::anyhow!(
                    "Included file not found: '{}' (from '{}' line {}).",
                    rel,
                    path.display(),
                    index + 1
                )
            })?;
            let nested = resolve_file(&target, stack, cache)?;
            resolved.lines.extend(nested.lines);
            resolved.origins.extend(nested.origins);
            continue;
        }
        resolved.lines.push(line.to_string());
        resolved.origins.push(SourceLineOrigin {
            file: path.to_path_buf(),
            line: index + 1,
        });
    }

    stack.pop();
    cache.insert(path.to_path_buf(), resolved.clone());
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, text).expect("write temp file");
        path
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tsh-imports-{}-{}", tag, std::process::id()));
        fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn splices_and_maps_lines() {
        let dir = temp_dir("splice");
        write(&dir, "lib.tsh", "fn helper() {\n}\n");
        let entry = write(&dir, "main.tsh", ".include \"lib.tsh\"\ngf {\n}\n");
        let merged = resolve_merged_source(&entry).unwrap();
        assert!(merged.source.contains("fn helper"));
        // merged line 1 is lib.tsh line 1, merged line 3 is main.tsh line 2
        let mapped = merged.map_position(1, 1);
        assert!(mapped.file.ends_with("lib.tsh"));
        assert_eq!(mapped.line, 1);
        let mapped = merged.map_position(3, 4);
        assert!(mapped.file.ends_with("main.tsh"));
        assert_eq!(mapped.line, 2);
        assert_eq!(mapped.column, 4);
    }

    #[test]
    fn include_cycles_are_rejected() {
        let dir = temp_dir("cycle");
        write(&dir, "a.tsh", ".include \"b.tsh\"\n");
        write(&dir, "b.tsh", ".include \"a.tsh\"\n");
        let err = resolve_merged_source(&dir.join("a.tsh")).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn missing_include_reports_origin() {
        let dir = temp_dir("missing");
        let entry = write(&dir, "main.tsh", ".include \"gone.tsh\"\n");
        let err = resolve_merged_source(&entry).unwrap_err();
        assert!(err.to_string().contains("gone.tsh"));
    }
}
