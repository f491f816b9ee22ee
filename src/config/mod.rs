//! Loading build configurations from disk.
//!
//! A configuration file is JSON and holds one of:
//!
//! - an object: a single configuration,
//! - an array of objects: an ordered set of configurations,
//! - a *variant document* `{"base": {...}, "variants": {...}}`, expanded
//!   into the cartesian product of its axes.
//!
//! String values may reference `${env.KEY}`, which is filled in from the
//! [`LoadContext`] built from the arguments after `--` on the command line.

mod find;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{BuildError, Result};
use crate::variants::{self, VariantSpec};

pub use find::{CONFIG_EXTENSIONS, find_config_file};

/// One task's parameters: a mapping of named fields.
pub type Configuration = Map<String, Value>;

/// Either a single configuration or an ordered sequence of them.
///
/// The position of a configuration is its identity when dispatched.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSet {
    Single(Configuration),
    Many(Vec<Configuration>),
}

impl ConfigSet {
    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Many(configs) => configs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configuration at `index`. A single configuration answers only index 0.
    pub fn get(&self, index: usize) -> Option<&Configuration> {
        match self {
            Self::Single(config) => (index == 0).then_some(config),
            Self::Many(configs) => configs.get(index),
        }
    }

    pub fn into_vec(self) -> Vec<Configuration> {
        match self {
            Self::Single(config) => vec![config],
            Self::Many(configs) => configs,
        }
    }
}

impl From<Configuration> for ConfigSet {
    fn from(config: Configuration) -> Self {
        Self::Single(config)
    }
}

impl From<Vec<Configuration>> for ConfigSet {
    fn from(configs: Vec<Configuration>) -> Self {
        Self::Many(configs)
    }
}

/// Explicit loader context, in place of reading the process arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadContext {
    /// Raw arguments passed through to the configuration.
    #[serde(default)]
    pub args: Vec<String>,
    /// `--env.KEY=VALUE` pairs extracted from `args`.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl LoadContext {
    /// Parse pass-through arguments.
    ///
    /// `--env.KEY=VALUE` and `--env.KEY VALUE` set a value, a bare
    /// `--env.KEY` followed by another flag (or nothing) sets `"true"`.
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let mut env = BTreeMap::new();

        let mut iter = args.iter().peekable();
        while let Some(arg) = iter.next() {
            let Some(rest) = arg.strip_prefix("--env.") else {
                continue;
            };
            if let Some((key, value)) = rest.split_once('=') {
                env.insert(key.to_string(), value.to_string());
            } else if let Some(value) = iter.next_if(|next| !next.starts_with("--")) {
                env.insert(rest.to_string(), value.clone());
            } else {
                env.insert(rest.to_string(), "true".to_string());
            }
        }

        Self { args, env }
    }
}

/// Load the configuration set at `path`.
pub fn load_config(path: &Path, context: &LoadContext) -> Result<ConfigSet> {
    let resolved = find_config_file(path).map_err(|_| BuildError::ConfigLoad {
        path: path.to_path_buf(),
        message: "File does not exist".to_string(),
    })?;
    let load_error = |message: String| BuildError::ConfigLoad {
        path: resolved.clone(),
        message,
    };

    let text = std::fs::read_to_string(&resolved).map_err(|e| load_error(e.to_string()))?;
    let value: Value = serde_json::from_str(&text).map_err(|e| load_error(e.to_string()))?;
    let value = substitute_env(value, context).map_err(load_error)?;

    parse_config_value(value).map_err(load_error)
}

/// Interpret an already-parsed JSON document as a configuration set.
pub fn parse_config_value(value: Value) -> std::result::Result<ConfigSet, String> {
    match value {
        Value::Object(mut object) if object.contains_key("variants") => {
            let spec = match object.remove("variants") {
                Some(Value::Object(axes)) => VariantSpec::from_object(&axes),
                _ => return Err("\"variants\" must be an object of arrays".to_string()),
            };
            let base = match object.remove("base") {
                Some(Value::Object(base)) => base,
                None => Configuration::new(),
                Some(_) => return Err("\"base\" must be an object".to_string()),
            };
            Ok(ConfigSet::Many(variants::generate_with_base(&base, &spec)))
        }
        Value::Object(object) => Ok(ConfigSet::Single(object)),
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Object(config) => Ok(config),
                other => Err(format!(
                    "entry {i} is not an object (found {})",
                    type_name(&other)
                )),
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(ConfigSet::Many),
        other => Err(format!(
            "expected an object or an array, found {}",
            type_name(&other)
        )),
    }
}

fn substitute_env(value: Value, context: &LoadContext) -> std::result::Result<Value, String> {
    Ok(match value {
        Value::String(s) => Value::String(interpolate(&s, context)?),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| substitute_env(item, context))
                .collect::<std::result::Result<_, _>>()?,
        ),
        Value::Object(object) => Value::Object(
            object
                .into_iter()
                .map(|(k, v)| substitute_env(v, context).map(|v| (k, v)))
                .collect::<std::result::Result<_, _>>()?,
        ),
        other => other,
    })
}

fn interpolate(input: &str, context: &LoadContext) -> std::result::Result<String, String> {
    const OPEN: &str = "${env.";

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        let end = after
            .find('}')
            .ok_or_else(|| format!("unterminated placeholder in {input:?}"))?;
        let key = &after[..end];
        let value = context
            .env
            .get(key)
            .ok_or_else(|| format!("no value for ${{env.{key}}}; pass --env.{key}=... after --"))?;
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn write_config(value: Value) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("build.json");
        std::fs::write(&path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_single_object() {
        let (_dir, path) = write_config(json!({"name": "app", "command": "true"}));
        let set = load_config(&path, &LoadContext::default()).unwrap();
        assert_eq!(set.len(), 1);
        assert!(matches!(set, ConfigSet::Single(_)));
        assert_eq!(set.get(0).unwrap()["name"], json!("app"));
        assert!(set.get(1).is_none());
    }

    #[test]
    fn test_load_array_preserves_order() {
        let (_dir, path) = write_config(json!([{"name": "a"}, {"name": "b"}, {"name": "c"}]));
        let set = load_config(&path, &LoadContext::default()).unwrap();
        let names: Vec<_> = set.into_vec().into_iter().map(|c| c["name"].clone()).collect();
        assert_eq!(names, vec![json!("a"), json!("b"), json!("c")]);
    }

    #[test]
    fn test_load_variant_document() {
        let (_dir, path) = write_config(json!({
            "base": {"command": "true"},
            "variants": {"target": ["web", "node"], "minify": [true, false]}
        }));
        let configs = load_config(&path, &LoadContext::default())
            .unwrap()
            .into_vec();
        assert_eq!(configs.len(), 4);
        assert_eq!(configs[1]["target"], json!("web"));
        assert_eq!(configs[1]["minify"], json!(false));
        assert!(configs.iter().all(|c| c["command"] == json!("true")));
    }

    #[test]
    fn test_missing_file_is_load_error() {
        let dir = tempdir().unwrap();
        let err = load_config(&dir.path().join("nope"), &LoadContext::default()).unwrap_err();
        match err {
            BuildError::ConfigLoad { message, .. } => assert!(message.contains("does not exist")),
            other => panic!("Expected ConfigLoad, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_json_is_load_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("build.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = load_config(&path, &LoadContext::default()).unwrap_err();
        assert!(matches!(err, BuildError::ConfigLoad { .. }));
    }

    #[test]
    fn test_array_with_non_object_rejected() {
        let err = parse_config_value(json!([{"a": 1}, 2])).unwrap_err();
        assert!(err.contains("entry 1"));
    }

    #[test]
    fn test_env_substitution() {
        let (_dir, path) = write_config(json!({"command": "echo ${env.mode}-${env.target}"}));
        let context = LoadContext::from_args(["--env.mode=prod", "--env.target", "web"]);
        let set = load_config(&path, &context).unwrap();
        assert_eq!(set.get(0).unwrap()["command"], json!("echo prod-web"));
    }

    #[test]
    fn test_env_missing_key_is_load_error() {
        let (_dir, path) = write_config(json!({"command": "echo ${env.mode}"}));
        let err = load_config(&path, &LoadContext::default()).unwrap_err();
        assert!(err.to_string().contains("--env.mode"));
    }

    #[test]
    fn test_context_from_args() {
        let context = LoadContext::from_args(["--env.prod", "--env.x=1", "--other", "value"]);
        assert_eq!(context.env.get("prod").map(String::as_str), Some("true"));
        assert_eq!(context.env.get("x").map(String::as_str), Some("1"));
        assert_eq!(context.env.len(), 2);
        assert_eq!(context.args.len(), 4);
    }
}
