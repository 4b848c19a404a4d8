use crate::envsubst::expand_env;
use anyhow::{anyhow, bail, Context, Result};
use serde::de::IntoDeserializer;
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};

use super::types::Config;
use super::validate::validate_config;

const INCLUDE_KEY: &str = "include";

pub fn load_config(path: &Path) -> Result<Config> {
    load_config_with_sources(path).map(|(config, _)| config)
}

/// Loads `path` and every file it includes; the second element lists the
/// canonical paths that contributed, in load order.
pub fn load_config_with_sources(path: &Path) -> Result<(Config, Vec<PathBuf>)> {
    let mut loader = Loader::default();
    let value = loader.load(path)?;

    let mut unknown = Vec::new();
    let config: Config =
        serde_ignored::deserialize(value.into_deserializer(), |key| unknown.push(key.to_string()))
            .with_context(|| format!("invalid bridge config {}", path.display()))?;
    if !unknown.is_empty() {
        unknown.sort();
        unknown.dedup();
        bail!(
            "unknown config keys (fix typos to avoid unexpected defaults): {}",
            unknown.join(", ")
        );
    }
    validate_config(&config)?;
    Ok((config, loader.sources))
}

#[derive(Default)]
struct Loader {
    /// Files currently being expanded, outermost first.
    open: Vec<PathBuf>,
    sources: Vec<PathBuf>,
}

impl Loader {
    /// Reads one file, expands `${VAR}`, and layers it on top of its
    /// includes. Later includes win over earlier ones, the file itself over
    /// all of them.
    fn load(&mut self, path: &Path) -> Result<Value> {
        let file = fs::canonicalize(path)
            .with_context(|| format!("config file {} not found", path.display()))?;
        if self.open.contains(&file) {
            bail!("config include loop through {}", file.display());
        }
        if !self.sources.contains(&file) {
            self.sources.push(file.clone());
        }

        let text = fs::read_to_string(&file)
            .with_context(|| format!("cannot read {}", file.display()))?;
        let text =
            expand_env(&text).with_context(|| format!("in {}", file.display()))?;
        let mut doc: Value = serde_yaml::from_str(&text)
            .with_context(|| format!("malformed YAML in {}", file.display()))?;

        let includes = match &mut doc {
            Value::Mapping(map) => map.remove(Value::String(INCLUDE_KEY.into())),
            _ => None,
        };
        let dir = file.parent().unwrap_or(Path::new(".")).to_path_buf();

        self.open.push(file);
        let mut layered = Value::Mapping(Mapping::new());
        for include in include_paths(includes, &dir)? {
            let value = self.load(&include)?;
            layered = overlay(layered, value);
        }
        self.open.pop();
        Ok(overlay(layered, doc))
    }
}

fn include_paths(includes: Option<Value>, dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match includes {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::String(one)) => vec![Value::String(one)],
        Some(Value::Sequence(many)) => many,
        Some(_) => bail!("include must be a file name or a list of file names"),
    };
    entries
        .into_iter()
        .map(|entry| match entry {
            Value::String(name) => Ok(dir.join(name)),
            other => Err(anyhow!("include entry {other:?} is not a file name")),
        })
        .collect()
}

/// Deep-merges mappings; anything else in `top` replaces `base`.
fn overlay(base: Value, top: Value) -> Value {
    let (mut base, top) = match (base, top) {
        (Value::Mapping(base), Value::Mapping(top)) => (base, top),
        (_, top) => return top,
    };
    for (key, value) in top {
        let value = match base.remove(&key) {
            Some(prev) => overlay(prev, value),
            None => value,
        };
        base.insert(key, value);
    }
    Value::Mapping(base)
}
