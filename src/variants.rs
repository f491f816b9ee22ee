//! Configuration variants.
//!
//! Expands a base configuration and a set of named variant axes into the
//! cartesian product of configurations. Axis order is insertion order, so
//! the output is deterministic: the last axis varies fastest.
//!
//! ```
//! use parabuild::variants::{VariantSpec, generate_with_base};
//! use serde_json::json;
//!
//! let base = json!({"name": "bundle"}).as_object().cloned().unwrap();
//! let spec = VariantSpec::new()
//!     .axis("rtl", [json!(true), json!(false)])
//!     .axis("debug", [json!(true), json!(false)]);
//!
//! let configs = generate_with_base(&base, &spec);
//! assert_eq!(configs.len(), 4);
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::config::Configuration;

/// Named axes of configuration values, in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariantSpec {
    axes: Vec<(String, Vec<Value>)>,
}

impl VariantSpec {
    /// Create an empty spec. Expanding it yields just the base configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an axis. A key that already exists is replaced in place.
    pub fn axis<I>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        let key = key.into();
        let values: Vec<Value> = values.into_iter().collect();
        match self.axes.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = values,
            None => self.axes.push((key, values)),
        }
        self
    }

    /// Number of configurations this spec expands to.
    pub fn combinations(&self) -> usize {
        self.axes.iter().map(|(_, values)| values.len()).product()
    }

    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    pub fn axes(&self) -> impl Iterator<Item = (&str, &[Value])> {
        self.axes.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Build a spec from a JSON object whose values are arrays.
    ///
    /// A non-array value is treated as a single-valued axis.
    pub fn from_object(object: &Map<String, Value>) -> Self {
        let axes = object
            .iter()
            .map(|(key, value)| {
                let values = match value {
                    Value::Array(values) => values.clone(),
                    other => vec![other.clone()],
                };
                (key.clone(), values)
            })
            .collect();
        Self { axes }
    }
}

impl Serialize for VariantSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let object: Map<String, Value> = self
            .axes
            .iter()
            .map(|(k, v)| (k.clone(), Value::Array(v.clone())))
            .collect();
        object.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for VariantSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let object = Map::<String, Value>::deserialize(deserializer)?;
        Ok(Self::from_object(&object))
    }
}

/// Expand `variants` over an empty base.
pub fn generate_from_variants(variants: &VariantSpec) -> Vec<Configuration> {
    expand(&Configuration::new(), variants)
}

/// Expand `variants` over `base`. Variant keys override base fields.
pub fn generate_with_base(base: &Configuration, variants: &VariantSpec) -> Vec<Configuration> {
    expand(base, variants)
}

/// Expand `variants` over an empty base and map `transform` over the result.
pub fn generate_with_transform<F>(variants: &VariantSpec, transform: F) -> Vec<Configuration>
where
    F: FnMut(Configuration) -> Configuration,
{
    generate(&Configuration::new(), variants, transform)
}

/// Expand `variants` over `base` and map `transform` over the result.
pub fn generate<F>(base: &Configuration, variants: &VariantSpec, transform: F) -> Vec<Configuration>
where
    F: FnMut(Configuration) -> Configuration,
{
    expand(base, variants).into_iter().map(transform).collect()
}

fn expand(base: &Configuration, variants: &VariantSpec) -> Vec<Configuration> {
    variants
        .axes
        .iter()
        .fold(vec![base.clone()], |configs, (key, values)| {
            configs
                .iter()
                .flat_map(|config| {
                    values.iter().map(move |value| {
                        let mut next = config.clone();
                        next.insert(key.clone(), value.clone());
                        next
                    })
                })
                .collect()
        })
}
