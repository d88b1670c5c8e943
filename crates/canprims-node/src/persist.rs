//! Export and import of persistent node settings.
//!
//! Only endpoints tagged `persistent` take part. The exported map is keyed
//! by endpoint name, then field name, and serializes to plain JSON.

use std::collections::BTreeMap;

use canprims_frame::Value;
use tracing::debug;

use crate::endpoint::{value_from_json, value_to_json, EndpointDescriptor};
use crate::error::{NodeError, Result};
use crate::node::Node;

/// Persistent settings: endpoint name → field name → value.
pub type ConfigMap = BTreeMap<String, BTreeMap<String, serde_json::Value>>;

impl Node {
    /// Read every persistent, readable endpoint.
    pub fn export_config(&self) -> Result<ConfigMap> {
        let mut config = ConfigMap::new();
        for endpoint in self.table().persistent() {
            if !endpoint.direction.can_read() {
                continue;
            }
            let values = self.read(&endpoint.name)?;
            let fields = endpoint
                .fields
                .iter()
                .zip(&values)
                .map(|(field, value)| (field.name.clone(), value_to_json(value)))
                .collect();
            config.insert(endpoint.name.clone(), fields);
        }
        debug!(node_id = self.node_id(), groups = config.len(), "config exported");
        Ok(config)
    }

    /// Write the settings in `config` back to the node.
    ///
    /// The whole map is checked against the endpoint table before anything
    /// is written. Fields missing from a group take their defaults.
    pub fn import_config(&self, config: &ConfigMap) -> Result<()> {
        let writes = config
            .iter()
            .map(|(name, fields)| -> Result<_> {
                let endpoint = self.table().get(name).ok_or_else(|| {
                    NodeError::InvalidConfig(format!("unknown endpoint '{name}'"))
                })?;
                if !endpoint.persistent || !endpoint.direction.can_write() {
                    return Err(NodeError::InvalidConfig(format!(
                        "endpoint '{name}' is not a writable persistent setting"
                    )));
                }
                Ok((endpoint, group_values(endpoint, fields)?))
            })
            .collect::<Result<Vec<_>>>()?;

        for (endpoint, values) in writes {
            let args: Vec<(&str, Value)> = values
                .iter()
                .map(|(field, value)| (field.as_str(), *value))
                .collect();
            self.call_named(&endpoint.name, &args)?;
        }
        debug!(node_id = self.node_id(), groups = config.len(), "config imported");
        Ok(())
    }
}

fn group_values(
    endpoint: &EndpointDescriptor,
    fields: &BTreeMap<String, serde_json::Value>,
) -> Result<Vec<(String, Value)>> {
    fields
        .iter()
        .map(|(name, json)| -> Result<(String, Value)> {
            let field = endpoint.field(name).ok_or_else(|| {
                NodeError::InvalidConfig(format!("endpoint '{}' has no field '{name}'", endpoint.name))
            })?;
            let value = value_from_json(json, field.ty).map_err(|err| {
                NodeError::InvalidConfig(format!("{}.{name}: {err}", endpoint.name))
            })?;
            Ok((name.clone(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::responder::{NodeResponder, ResponderConfig};
    use crate::test_support::{fast_node_config, table, Harness};

    fn setup() -> (Harness, NodeResponder, Node) {
        let harness = Harness::new();
        let responder = NodeResponder::start(
            Arc::clone(&harness.device),
            2,
            table(),
            ResponderConfig::default(),
        )
        .unwrap();
        let node = Node::with_table(Arc::clone(&harness.host), 2, table(), fast_node_config());
        (harness, responder, node)
    }

    #[test]
    fn test_export_persistent_only() {
        let (_harness, responder, node) = setup();
        responder
            .set_values("current_limit", vec![Value::U16(1800)])
            .unwrap();

        let config = node.export_config().unwrap();
        assert_eq!(
            config.keys().collect::<Vec<_>>(),
            vec!["current_limit", "target_speed"]
        );
        assert_eq!(config["current_limit"]["milliamps"], json!(1800));
        assert_eq!(config["target_speed"]["ramp_ms"], json!(250));
    }

    #[test]
    fn test_import_round_trip() {
        let (_harness, responder, node) = setup();
        let config: ConfigMap = serde_json::from_value(json!({
            "target_speed": {"rpm": 750.5, "ramp_ms": 40},
            "current_limit": {"milliamps": 2200}
        }))
        .unwrap();

        node.import_config(&config).unwrap();
        assert_eq!(
            responder.values("target_speed"),
            Some(vec![Value::F32(750.5), Value::U16(40)])
        );
        assert_eq!(node.export_config().unwrap(), config);
    }

    #[test]
    fn test_import_validates_before_writing() {
        let (_harness, responder, node) = setup();
        let config: ConfigMap = serde_json::from_value(json!({
            "current_limit": {"milliamps": 900},
            "motor_speed": {"rpm": 1.0}
        }))
        .unwrap();

        assert!(matches!(
            node.import_config(&config),
            Err(NodeError::InvalidConfig(_))
        ));
        assert_eq!(responder.values("current_limit"), Some(vec![Value::U16(0)]));

        let bad_value: ConfigMap =
            serde_json::from_value(json!({"current_limit": {"milliamps": -5}})).unwrap();
        assert!(matches!(
            node.import_config(&bad_value),
            Err(NodeError::InvalidConfig(_))
        ));
    }
}
