//! Step parameter values
//!
//! Parameters are an open-ended tree of strings, numbers, lists and maps.
//! Anything that needs to look at "every string in a step" (placeholder
//! detection, substitution) goes through [`ParamValue::visit_strings`] or
//! [`ParamValue::try_map_strings`] so new actions need no special handling.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Parameters of one step, keyed by name. Ordered so plans serialize stably.
pub type Params = BTreeMap<String, ParamValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<ParamValue>),
    Map(BTreeMap<String, ParamValue>),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ParamValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// A list of plain strings. A single string counts as a one-element list.
    pub fn as_string_list(&self) -> Option<Vec<String>> {
        match self {
            ParamValue::String(s) => Some(vec![s.clone()]),
            ParamValue::List(items) => items
                .iter()
                .map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => None,
        }
    }

    /// A map whose values are all plain strings.
    pub fn as_string_map(&self) -> Option<BTreeMap<String, String>> {
        match self {
            ParamValue::Map(map) => map
                .iter()
                .map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect(),
            _ => None,
        }
    }

    /// Call `f(path, value)` for every string leaf.
    ///
    /// Paths look like `url`, `binaries[1]` or `vars.PATH`.
    pub fn visit_strings<'a, F>(&'a self, path: &str, f: &mut F)
    where
        F: FnMut(&str, &'a str),
    {
        match self {
            ParamValue::String(s) => f(path, s),
            ParamValue::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    item.visit_strings(&format!("{}[{}]", path, i), f);
                }
            }
            ParamValue::Map(map) => {
                for (key, value) in map {
                    value.visit_strings(&format!("{}.{}", path, key), f);
                }
            }
            ParamValue::Bool(_) | ParamValue::Integer(_) | ParamValue::Float(_) => {}
        }
    }

    /// Rebuild the value with every string leaf replaced by `f(path, value)`.
    pub fn try_map_strings<E, F>(&self, path: &str, f: &mut F) -> Result<ParamValue, E>
    where
        F: FnMut(&str, &str) -> Result<String, E>,
    {
        Ok(match self {
            ParamValue::String(s) => ParamValue::String(f(path, s)?),
            ParamValue::List(items) => ParamValue::List(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| item.try_map_strings(&format!("{}[{}]", path, i), f))
                    .collect::<Result<_, E>>()?,
            ),
            ParamValue::Map(map) => ParamValue::Map(
                map.iter()
                    .map(|(key, value)| {
                        value
                            .try_map_strings(&format!("{}.{}", path, key), f)
                            .map(|v| (key.clone(), v))
                    })
                    .collect::<Result<_, E>>()?,
            ),
            other => other.clone(),
        })
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::String(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::String(s)
    }
}

/// Visit every string leaf across a parameter map.
pub fn visit_params<'a, F>(params: &'a Params, mut f: F)
where
    F: FnMut(&str, &'a str),
{
    for (key, value) in params {
        value.visit_strings(key, &mut f);
    }
}

pub fn get_str<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params.get(key).and_then(ParamValue::as_str)
}
