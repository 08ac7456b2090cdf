//! Reading a function specification from disk.
//!
//! A file holds the whole specification as JSON. A directory holds
//! `function.json` (the specification without code) next to the code
//! files, which are keyed by their path relative to the directory.

use std::fs;
use std::path::Path;

use anyhow::{Context, anyhow};
use serde_json::{Map, Value, json};
use walkdir::WalkDir;

use fleet_core::FunctionSpecification;

const SPEC_FILE: &str = "function.json";

/// Directory names never shipped as code.
const SKIPPED: &[&str] = &[".git", "node_modules"];

pub fn load(path: &Path) -> anyhow::Result<FunctionSpecification> {
    let value = if path.is_dir() {
        load_dir(path)?
    } else {
        read_json(path)?
    };
    serde_json::from_value(value)
        .with_context(|| format!("invalid specification in {}", path.display()))
}

fn load_dir(dir: &Path) -> anyhow::Result<Value> {
    let manifest = dir.join(SPEC_FILE);
    let mut value = read_json(&manifest)?;
    let spec = value
        .as_object_mut()
        .ok_or_else(|| anyhow!("{} must hold a JSON object", manifest.display()))?;

    let mut files = Map::new();
    let walker = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.file_name().to_str().is_none_or(|name| !SKIPPED.contains(&name)));
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(dir)?;
        if relative == Path::new(SPEC_FILE) {
            continue;
        }
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let content = fs::read_to_string(entry.path())
            .with_context(|| format!("reading {}", entry.path().display()))?;
        files.insert(key, Value::String(content));
    }

    let code = spec.entry("code").or_insert_with(|| json!({}));
    code.as_object_mut()
        .ok_or_else(|| anyhow!("`code` in {} must be an object", manifest.display()))?
        .insert("files".to_string(), Value::Object(files));
    Ok(value)
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}
