use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;

use crate::output::{AttributeSpec, Caster, OutputSpec};
use crate::resources::Amount;

/// System description loaded once by the driver and passed by reference;
/// nothing in the simulator mutates it after startup.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub system_name: String,
    /// Group templates in instantiation order.
    pub groups: Vec<(String, HashMap<String, Amount>)>,
    /// Nodes per group, same order.
    pub node_counts: Vec<(String, usize)>,
    pub node_prefix: String,
    /// Display order of resource types in outputs.
    pub resource_order: Vec<String>,
    pub scheduling_output: Option<OutputSpec>,
    pub pprint_output: Option<OutputSpec>,
}

#[derive(Debug, Deserialize)]
struct RawOutput {
    format: String,
    #[serde(default)]
    attributes: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    system_name: Option<String>,
    groups: BTreeMap<String, BTreeMap<String, Amount>>,
    resources: BTreeMap<String, usize>,
    #[serde(default)]
    node_prefix: Option<String>,
    #[serde(default)]
    resource_order: Option<Vec<String>>,
    #[serde(default)]
    scheduling_output: Option<RawOutput>,
    #[serde(default)]
    pprint_output: Option<RawOutput>,
}

/// Replace every `{"__tuple__": true, "items": [...]}` marker with the plain
/// sequence it encodes, recursively.
pub fn decode_tuples(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            if map.get("__tuple__").and_then(Value::as_bool) == Some(true) {
                if let Some(Value::Array(items)) = map.get("items") {
                    return Value::Array(
                        items.clone().into_iter().map(decode_tuples).collect(),
                    );
                }
            }
            Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, decode_tuples(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(decode_tuples).collect()),
        other => other,
    }
}

impl SystemConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read system config {}", path.display()))?;
        Self::from_str(&text)
            .with_context(|| format!("invalid system config {}", path.display()))
    }

    pub fn from_str(text: &str) -> anyhow::Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(decode_tuples(value))
    }

    fn from_value(value: Value) -> anyhow::Result<Self> {
        let raw: RawConfig = serde_json::from_value(value)?;

        let groups: Vec<(String, HashMap<String, Amount>)> = raw
            .groups
            .into_iter()
            .map(|(name, caps)| (name, caps.into_iter().collect()))
            .collect();
        let node_counts: Vec<(String, usize)> = raw.resources.into_iter().collect();
        for (name, _) in &node_counts {
            anyhow::ensure!(
                groups.iter().any(|(g, _)| g == name),
                "node count refers to unknown group {}",
                name
            );
        }

        let resource_order = match raw.resource_order {
            Some(order) => order,
            None => {
                let mut order = vec![];
                for (_, caps) in &groups {
                    let mut names: Vec<&String> = caps.keys().collect();
                    names.sort();
                    for name in names {
                        if !order.contains(name) {
                            order.push(name.clone());
                        }
                    }
                }
                order
            }
        };

        Ok(Self {
            system_name: raw.system_name.unwrap_or_default(),
            groups,
            node_counts,
            node_prefix: raw.node_prefix.unwrap_or_else(|| "node_".to_string()),
            resource_order,
            scheduling_output: raw.scheduling_output.map(convert_output).transpose()?,
            pprint_output: raw.pprint_output.map(convert_output).transpose()?,
        })
    }
}

/// Attribute tuples carry the source paths first and the caster name last.
fn convert_output(raw: RawOutput) -> anyhow::Result<OutputSpec> {
    let mut attributes = vec![];
    for (name, tuple) in raw.attributes {
        let (caster_name, sources) = match tuple.split_last() {
            Some((caster, sources)) if !sources.is_empty() => (caster, sources),
            _ => anyhow::bail!(
                "attribute {} needs at least one source and a caster",
                name
            ),
        };
        attributes.push((
            name,
            AttributeSpec {
                sources: sources.to_vec(),
                caster: Caster::from_name(caster_name)?,
            },
        ));
    }
    Ok(OutputSpec {
        format: raw.format,
        attributes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
    {
        "system_name": "testbed",
        "groups": {"g0": {"core": 4, "mem": 8}},
        "resources": {"g0": 2},
        "resource_order": ["core", "mem"],
        "scheduling_output": {
            "format": "{id};{alloc}",
            "attributes": {
                "id": {"__tuple__": true, "items": ["id", "str_"]},
                "alloc": {"__tuple__": true,
                          "items": ["assigned_nodes", "requested_resources", "str_resources"]}
            }
        }
    }"#;

    #[test]
    fn test_decode_tuples() {
        let value: Value =
            serde_json::from_str(r#"{"a": {"__tuple__": true, "items": [1, 2]}, "b": [3]}"#)
                .unwrap();
        let decoded = decode_tuples(value);
        assert_eq!(decoded["a"], serde_json::json!([1, 2]));
        assert_eq!(decoded["b"], serde_json::json!([3]));
    }

    #[test]
    fn test_parse_sample_config() {
        let config = SystemConfig::from_str(SAMPLE).unwrap();
        assert_eq!(config.system_name, "testbed");
        assert_eq!(config.groups.len(), 1);
        assert_eq!(config.groups[0].0, "g0");
        assert_eq!(config.groups[0].1["core"], 4);
        assert_eq!(config.node_counts, vec![("g0".to_string(), 2)]);
        assert_eq!(config.node_prefix, "node_");

        let spec = config.scheduling_output.unwrap();
        assert_eq!(spec.format, "{id};{alloc}");
        let alloc = &spec.attributes.iter().find(|(n, _)| n == "alloc").unwrap().1;
        assert_eq!(alloc.sources.len(), 2);
        assert_eq!(alloc.caster, Caster::NodeResources);
        assert!(config.pprint_output.is_none());
    }

    #[test]
    fn test_unknown_group_in_counts_rejected() {
        let text = r#"{"groups": {"g0": {"core": 1, "mem": 1}}, "resources": {"g1": 2}}"#;
        assert!(SystemConfig::from_str(text).is_err());
    }

    #[test]
    fn test_unknown_caster_rejected() {
        let text = r#"
        {
            "groups": {"g0": {"core": 1, "mem": 1}},
            "resources": {"g0": 1},
            "scheduling_output": {
                "format": "{id}",
                "attributes": {"id": {"__tuple__": true, "items": ["id", "str_bogus"]}}
            }
        }"#;
        assert!(SystemConfig::from_str(text).is_err());
    }

    #[test]
    fn test_resource_order_defaults_to_group_resources() {
        let text = r#"{"groups": {"g0": {"mem": 1, "core": 1}}, "resources": {"g0": 1}}"#;
        let config = SystemConfig::from_str(text).unwrap();
        assert_eq!(config.resource_order, vec!["core".to_string(), "mem".to_string()]);
    }
}
