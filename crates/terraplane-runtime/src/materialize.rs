use crate::RuntimeError;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use terraplane_schema::{validate_template_name, BackendDescriptor};
use terraplane_store::WorkspaceHandle;
use tracing::{debug, warn};

pub const BACKEND_FILE: &str = "backend.tf";
pub const VARIABLES_FILE: &str = "terraform.tfvars";
pub const PLAN_FILE: &str = "tfplan";

/// Locate a named template under `templates_dir`.
pub fn resolve_template(templates_dir: &Path, name: &str) -> Result<PathBuf, RuntimeError> {
    validate_template_name(name).map_err(|e| RuntimeError::TemplateNotFound(e.to_string()))?;
    let path = templates_dir.join(name);
    if !path.is_dir() {
        return Err(RuntimeError::TemplateNotFound(format!(
            "{name} (looked in {})",
            templates_dir.display()
        )));
    }
    Ok(path)
}

/// Stage `template_dir` into the workspace root and write the backend block.
///
/// Whatever was in the root before is removed first; only remote state
/// survives between runs. The template itself is only ever read. Returns the
/// number of template files copied.
pub fn materialize(template_dir: &Path, handle: &WorkspaceHandle) -> Result<usize, RuntimeError> {
    if !template_dir.is_dir() {
        return Err(RuntimeError::TemplateNotFound(
            template_dir.display().to_string(),
        ));
    }

    // Read the template before touching the root so a bad template leaves
    // the previous execution directory alone.
    let files = collect_files(template_dir, template_dir)?;
    if files.is_empty() {
        return Err(RuntimeError::Materialize(format!(
            "template {} contains no files",
            template_dir.display()
        )));
    }

    let root = &handle.root;
    if root.exists() {
        fs::remove_dir_all(root).map_err(|e| {
            RuntimeError::Materialize(format!("cannot clear {}: {e}", root.display()))
        })?;
    }
    fs::create_dir_all(root)
        .map_err(|e| RuntimeError::Materialize(format!("cannot create {}: {e}", root.display())))?;

    for rel in &files {
        let dest = root.join(rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                RuntimeError::Materialize(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        fs::copy(template_dir.join(rel), &dest).map_err(|e| {
            RuntimeError::Materialize(format!("cannot copy {}: {e}", rel.display()))
        })?;
    }

    if files.iter().any(|f| f == Path::new(BACKEND_FILE)) {
        warn!(
            "template {} ships its own {BACKEND_FILE}; replacing it",
            template_dir.display()
        );
    }
    let backend_path = root.join(BACKEND_FILE);
    fs::write(&backend_path, render_backend_config(&handle.backend)).map_err(|e| {
        RuntimeError::Materialize(format!("cannot write {}: {e}", backend_path.display()))
    })?;

    debug!(
        "materialized {} files from {} into {}",
        files.len(),
        template_dir.display(),
        root.display()
    );
    Ok(files.len())
}

fn collect_files(base: &Path, dir: &Path) -> Result<Vec<PathBuf>, RuntimeError> {
    let mut out = Vec::new();
    let entries = fs::read_dir(dir)
        .map_err(|e| RuntimeError::Materialize(format!("cannot read {}: {e}", dir.display())))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            out.extend(collect_files(base, &path)?);
        } else if file_type.is_file() {
            let rel = path
                .strip_prefix(base)
                .map_err(|e| RuntimeError::Materialize(e.to_string()))?;
            out.push(rel.to_path_buf());
        } else {
            debug!("skipping non-regular template entry {}", path.display());
        }
    }
    out.sort();
    Ok(out)
}

/// Render the one backend block the tool reads for remote state and locking.
pub fn render_backend_config(backend: &BackendDescriptor) -> String {
    format!(
        r#"terraform {{
  backend "s3" {{
    bucket         = {bucket}
    key            = {key}
    region         = {region}
    dynamodb_table = {table}
    encrypt        = true
  }}
}}
"#,
        bucket = hcl_quote(&backend.bucket),
        key = hcl_quote(&backend.key),
        region = hcl_quote(&backend.region),
        table = hcl_quote(&backend.lock_table),
    )
}

/// Render caller variables as `name = "value"` lines, sorted by name.
pub fn render_variables(variables: &BTreeMap<String, String>) -> Result<String, RuntimeError> {
    let mut out = String::new();
    for (name, value) in variables {
        if !is_identifier(name) {
            return Err(RuntimeError::InvalidVariable(name.clone()));
        }
        let _ = writeln!(out, "{name} = {}", hcl_quote(value));
    }
    Ok(out)
}

pub fn write_variables(
    root: &Path,
    variables: &BTreeMap<String, String>,
) -> Result<(), RuntimeError> {
    let content = render_variables(variables)?;
    fs::write(root.join(VARIABLES_FILE), content)?;
    Ok(())
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Quote a string literal, escaping quotes, backslashes, control characters,
/// and template sequences.
fn hcl_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '$' | '%' if chars.peek() == Some(&'{') => {
                out.push(c);
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
