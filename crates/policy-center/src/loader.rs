//! Layered policy loading: builtin defaults, then files, environment and CLI pairs.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::api::apply_override_to_snapshot;
use crate::defaults::default_snapshot;
use crate::errors::PolicyError;
use crate::model::{PolicySnapshot, PolicySource};

/// `BROWSERFLOW_POLICY__SCHEDULER__WORKER_COUNT=8` sets `scheduler.worker_count`.
const ENV_PREFIX: &str = "BROWSERFLOW_POLICY__";
/// A whole JSON document merged as one env layer.
const ENV_JSON: &str = "BROWSERFLOW_POLICY_OVERRIDE_JSON";
/// Comma-separated `path=value` pairs, treated like command line overrides.
const ENV_CLI_OVERRIDES: &str = "BROWSERFLOW_POLICY_CLI_OVERRIDES";

const SECTIONS: [&str; 5] = ["scheduler", "interpreter", "recovery", "variables", "logging"];

#[derive(Debug, Default)]
pub struct LoadOptions {
    pub paths: Vec<PathBuf>,
    pub include_env: bool,
    pub include_cli_env: bool,
    /// `path=value` pairs supplied on the command line.
    pub cli_overrides: Vec<String>,
}

impl LoadOptions {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            paths: vec![path.into()],
            include_env: true,
            include_cli_env: true,
            cli_overrides: Vec::new(),
        }
    }
}

pub fn load_snapshot(path: Option<&Path>) -> Result<PolicySnapshot, PolicyError> {
    let options = LoadOptions {
        paths: path.map(Path::to_path_buf).into_iter().collect(),
        include_env: true,
        include_cli_env: true,
        cli_overrides: Vec::new(),
    };
    load_snapshot_with_options(&options)
}

/// Builds a snapshot from defaults plus every enabled layer, later layers winning.
pub fn load_snapshot_with_options(options: &LoadOptions) -> Result<PolicySnapshot, PolicyError> {
    let mut snapshot = default_snapshot();
    mark_builtin(&mut snapshot)?;

    let mut layers = Vec::new();
    for path in &options.paths {
        layers.push(file_layer(path)?);
    }
    if options.include_env {
        layers.push(env_layer()?);
    }
    if options.include_cli_env {
        if let Ok(raw) = env::var(ENV_CLI_OVERRIDES) {
            layers.push(pair_layer(raw.split(',')));
        }
    }
    layers.push(pair_layer(options.cli_overrides.iter().map(String::as_str)));

    for layer in layers {
        for (path, value) in &layer.entries {
            apply_override_to_snapshot(&mut snapshot, path, value, layer.source)?;
        }
    }
    Ok(snapshot)
}

/// Leaf assignments that share one provenance.
struct Layer {
    source: PolicySource,
    entries: Vec<(String, Value)>,
}

impl Layer {
    fn new(source: PolicySource) -> Self {
        Self {
            source,
            entries: Vec::new(),
        }
    }

    fn push_tree(&mut self, tree: Value) {
        collect_leaves(tree, String::new(), &mut self.entries);
    }
}

fn file_layer(path: &Path) -> Result<Layer, PolicyError> {
    if !path.exists() {
        return Err(PolicyError::Io(format!(
            "policy file {} does not exist",
            path.display()
        )));
    }
    debug!(path = %path.display(), "loading policy file");
    let text = fs::read_to_string(path).map_err(|err| PolicyError::Io(err.to_string()))?;
    let document: serde_yaml::Value =
        serde_yaml::from_str(&text).map_err(|err| PolicyError::Invalid(err.to_string()))?;
    let tree = serde_json::to_value(document).map_err(|err| PolicyError::Invalid(err.to_string()))?;

    let mut layer = Layer::new(PolicySource::File);
    layer.push_tree(tree);
    Ok(layer)
}

fn env_layer() -> Result<Layer, PolicyError> {
    let mut layer = Layer::new(PolicySource::Env);
    for (key, raw) in env::vars() {
        let Some(rest) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let segments: Vec<String> = rest
            .split("__")
            .filter(|segment| !segment.is_empty())
            .map(str::to_ascii_lowercase)
            .collect();
        if !segments.is_empty() {
            layer.entries.push((segments.join("."), scalar(&raw)));
        }
    }

    match env::var(ENV_JSON) {
        Ok(raw) if !raw.trim().is_empty() => {
            let tree: Value =
                serde_json::from_str(&raw).map_err(|err| PolicyError::Invalid(err.to_string()))?;
            layer.push_tree(tree);
        }
        _ => {}
    }
    Ok(layer)
}

/// Malformed tokens (no `=`, empty path) are ignored.
fn pair_layer<'a>(pairs: impl Iterator<Item = &'a str>) -> Layer {
    let mut layer = Layer::new(PolicySource::Cli);
    layer.entries = pairs
        .filter_map(|token| token.trim().split_once('='))
        .map(|(path, raw)| (path.trim(), raw.trim()))
        .filter(|(path, _)| !path.is_empty())
        .map(|(path, raw)| (path.to_string(), scalar(raw)))
        .collect();
    layer
}

/// JSON when it parses, otherwise the raw text.
fn scalar(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn collect_leaves(value: Value, prefix: String, out: &mut Vec<(String, Value)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let key = key.trim().to_ascii_lowercase();
                let path = if prefix.is_empty() {
                    key
                } else {
                    format!("{prefix}.{key}")
                };
                collect_leaves(child, path, out);
            }
        }
        leaf if !prefix.is_empty() => out.push((prefix, leaf)),
        _ => {}
    }
}

fn mark_builtin(snapshot: &mut PolicySnapshot) -> Result<(), PolicyError> {
    let tree = serde_json::to_value(&*snapshot).map_err(|err| PolicyError::Invalid(err.to_string()))?;
    let mut leaves = Vec::new();
    for section in SECTIONS {
        if let Some(value) = tree.get(section) {
            collect_leaves(value.clone(), section.to_string(), &mut leaves);
        }
    }
    for (path, _) in leaves {
        snapshot.set_provenance(&path, PolicySource::Builtin);
    }
    Ok(())
}
