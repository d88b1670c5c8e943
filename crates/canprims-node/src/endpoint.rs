use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use canprims_frame::address::is_reserved;
use canprims_frame::{
    coerce, encoded_size, FrameError, PrimitiveType, Value, CLASSIC_MAX_PAYLOAD, MAX_ENDPOINT_ID,
};
use serde::{Deserialize, Serialize};

use crate::error::{CallError, NodeError, Result};

/// Which operations an endpoint accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    Read,
    Write,
    ReadWrite,
}

impl Direction {
    pub fn can_read(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::ReadWrite => "read-write",
        }
    }
}

/// One typed field of an endpoint payload.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub ty: PrimitiveType,
    pub unit: Option<String>,
    /// Value used when a write omits this field.
    pub default: Option<Value>,
}

/// A named endpoint of a node.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointDescriptor {
    pub name: String,
    pub id: u8,
    pub direction: Direction,
    pub fields: Vec<FieldDescriptor>,
    /// Included in config export/import.
    pub persistent: bool,
}

impl EndpointDescriptor {
    pub fn field_types(&self) -> Vec<PrimitiveType> {
        self.fields.iter().map(|field| field.ty).collect()
    }

    /// Payload size of a full set of values.
    pub fn encoded_size(&self) -> usize {
        encoded_size(&self.field_types())
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Initial value of every field: its default, or zero.
    pub fn initial_values(&self) -> Vec<Value> {
        self.fields
            .iter()
            .map(|field| field.default.unwrap_or(Value::zero(field.ty)))
            .collect()
    }

    /// Complete positional write arguments.
    ///
    /// Trailing omitted arguments take the field default. A field without
    /// default that was omitted fails with [`CallError::MissingArgument`].
    pub fn complete_args(&self, args: &[Value]) -> std::result::Result<Vec<Value>, CallError> {
        if args.len() > self.fields.len() {
            return Err(CallError::TooManyArguments {
                endpoint: self.name.clone(),
                expected: self.fields.len(),
                actual: args.len(),
            });
        }

        let mut values = args.to_vec();
        for field in &self.fields[args.len()..] {
            match field.default {
                Some(default) => values.push(default),
                None => {
                    return Err(CallError::MissingArgument {
                        endpoint: self.name.clone(),
                        field: field.name.clone(),
                    })
                }
            }
        }
        Ok(values)
    }

    /// Order named arguments by field, filling omitted ones from defaults.
    pub fn args_by_name(
        &self,
        args: &[(&str, Value)],
    ) -> std::result::Result<Vec<Value>, CallError> {
        if let Some((unknown, _)) = args.iter().find(|(name, _)| self.field(name).is_none()) {
            return Err(CallError::UnknownField {
                endpoint: self.name.clone(),
                field: (*unknown).to_string(),
            });
        }

        self.fields
            .iter()
            .map(|field| {
                args.iter()
                    .rev()
                    .find(|(name, _)| *name == field.name)
                    .map(|(_, value)| *value)
                    .or(field.default)
                    .ok_or_else(|| CallError::MissingArgument {
                        endpoint: self.name.clone(),
                        field: field.name.clone(),
                    })
            })
            .collect()
    }
}

/// On-disk form of one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEndpoint {
    id: u32,
    direction: Direction,
    field_types: Vec<PrimitiveType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    field_labels: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    field_units: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    field_defaults: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    persistent: bool,
}

/// The endpoints a node exposes, by name and by id.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointTable {
    endpoints: BTreeMap<String, EndpointDescriptor>,
    by_id: HashMap<u8, String>,
}

impl EndpointTable {
    /// Build a table, checking ids and payload sizes against `max_payload`.
    pub fn new(endpoints: Vec<EndpointDescriptor>, max_payload: usize) -> Result<Self> {
        let mut table = Self {
            endpoints: BTreeMap::new(),
            by_id: HashMap::new(),
        };

        for endpoint in endpoints {
            if endpoint.id > MAX_ENDPOINT_ID || is_reserved(endpoint.id) {
                return Err(NodeError::InvalidTable(format!(
                    "endpoint '{}' uses reserved or out-of-range id {}",
                    endpoint.name, endpoint.id
                )));
            }
            let size = endpoint.encoded_size();
            if size > max_payload {
                return Err(NodeError::InvalidTable(format!(
                    "endpoint '{}' needs {size} bytes, frames carry {max_payload}",
                    endpoint.name
                )));
            }
            if let Some(other) = table.by_id.get(&endpoint.id) {
                return Err(NodeError::InvalidTable(format!(
                    "endpoints '{other}' and '{}' share id {}",
                    endpoint.name, endpoint.id
                )));
            }
            if table.endpoints.contains_key(&endpoint.name) {
                return Err(NodeError::InvalidTable(format!(
                    "duplicate endpoint name '{}'",
                    endpoint.name
                )));
            }

            table.by_id.insert(endpoint.id, endpoint.name.clone());
            table.endpoints.insert(endpoint.name.clone(), endpoint);
        }

        Ok(table)
    }

    /// Parse a JSON table for classic CAN frames.
    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_json_with_limit(json, CLASSIC_MAX_PAYLOAD)
    }

    /// Parse a JSON table with an explicit frame payload limit.
    pub fn from_json_with_limit(json: &str, max_payload: usize) -> Result<Self> {
        let raw: BTreeMap<String, RawEndpoint> = serde_json::from_str(json)?;
        Self::from_raw(raw, max_payload)
    }

    /// Parse a JSON table from bytes (e.g. a fetched blob).
    pub fn from_slice(json: &[u8], max_payload: usize) -> Result<Self> {
        let raw: BTreeMap<String, RawEndpoint> = serde_json::from_slice(json)?;
        Self::from_raw(raw, max_payload)
    }

    /// Load a JSON table from a file.
    pub fn from_file(path: &Path, max_payload: usize) -> Result<Self> {
        let json = std::fs::read(path).map_err(|err| {
            NodeError::InvalidTable(format!("{}: {err}", path.display()))
        })?;
        Self::from_slice(&json, max_payload)
    }

    /// Serialize back into the JSON table form.
    pub fn to_json(&self) -> Result<String> {
        let raw: BTreeMap<&str, RawEndpoint> = self
            .endpoints
            .values()
            .map(|endpoint| (endpoint.name.as_str(), to_raw(endpoint)))
            .collect();
        Ok(serde_json::to_string(&raw)?)
    }

    pub fn get(&self, name: &str) -> Option<&EndpointDescriptor> {
        self.endpoints.get(name)
    }

    /// Look up an endpoint, failing with [`CallError::UnknownEndpoint`].
    pub fn endpoint(&self, name: &str) -> std::result::Result<&EndpointDescriptor, CallError> {
        self.get(name)
            .ok_or_else(|| CallError::UnknownEndpoint(name.to_string()))
    }

    pub fn by_id(&self, id: u8) -> Option<&EndpointDescriptor> {
        self.by_id.get(&id).and_then(|name| self.endpoints.get(name))
    }

    /// Endpoints in name order.
    pub fn iter(&self) -> impl Iterator<Item = &EndpointDescriptor> {
        self.endpoints.values()
    }

    /// Endpoints tagged for config export/import.
    pub fn persistent(&self) -> impl Iterator<Item = &EndpointDescriptor> {
        self.iter().filter(|endpoint| endpoint.persistent)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    fn from_raw(raw: BTreeMap<String, RawEndpoint>, max_payload: usize) -> Result<Self> {
        let endpoints = raw
            .into_iter()
            .map(|(name, raw)| from_raw(name, raw))
            .collect::<Result<Vec<_>>>()?;
        Self::new(endpoints, max_payload)
    }
}

fn from_raw(name: String, raw: RawEndpoint) -> Result<EndpointDescriptor> {
    let invalid = |msg: String| NodeError::InvalidTable(format!("endpoint '{name}': {msg}"));

    let id = u8::try_from(raw.id)
        .ok()
        .filter(|id| *id <= MAX_ENDPOINT_ID)
        .ok_or_else(|| invalid(format!("id {} out of range", raw.id)))?;

    let count = raw.field_types.len();
    let labels = match raw.field_labels {
        Some(labels) if labels.len() != count => {
            return Err(invalid(format!("{} labels for {count} fields", labels.len())))
        }
        Some(labels) => labels,
        None => (0..count).map(|index| format!("field{index}")).collect(),
    };
    let units = match raw.field_units {
        Some(units) if units.len() != count => {
            return Err(invalid(format!("{} units for {count} fields", units.len())))
        }
        Some(units) => units.into_iter().map(|unit| (!unit.is_empty()).then_some(unit)).collect(),
        None => vec![None; count],
    };

    let mut defaults = raw.field_defaults.unwrap_or_default();
    let fields = raw
        .field_types
        .into_iter()
        .zip(labels)
        .zip(units)
        .map(|((ty, label), unit)| -> Result<FieldDescriptor> {
            let default = defaults
                .remove(&label)
                .map(|json| value_from_json(&json, ty))
                .transpose()
                .map_err(|err| invalid(format!("default for '{label}': {err}")))?;
            Ok(FieldDescriptor {
                name: label,
                ty,
                unit,
                default,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    if let Some(label) = defaults.keys().next() {
        return Err(invalid(format!("default for unknown field '{label}'")));
    }

    Ok(EndpointDescriptor {
        name,
        id,
        direction: raw.direction,
        fields,
        persistent: raw.persistent,
    })
}

fn to_raw(endpoint: &EndpointDescriptor) -> RawEndpoint {
    let defaults: BTreeMap<String, serde_json::Value> = endpoint
        .fields
        .iter()
        .filter_map(|field| Some((field.name.clone(), value_to_json(&field.default?))))
        .collect();
    let has_units = endpoint.fields.iter().any(|field| field.unit.is_some());

    RawEndpoint {
        id: u32::from(endpoint.id),
        direction: endpoint.direction,
        field_types: endpoint.field_types(),
        field_labels: Some(endpoint.fields.iter().map(|f| f.name.clone()).collect()),
        field_units: has_units.then(|| {
            endpoint
                .fields
                .iter()
                .map(|field| field.unit.clone().unwrap_or_default())
                .collect()
        }),
        field_defaults: (!defaults.is_empty()).then_some(defaults),
        persistent: endpoint.persistent,
    }
}

/// Convert a JSON scalar into a value of `ty`.
pub fn value_from_json(json: &serde_json::Value, ty: PrimitiveType) -> canprims_frame::Result<Value> {
    let value = match json {
        serde_json::Value::Bool(v) => Value::Bool(*v),
        serde_json::Value::Number(n) => {
            if let Some(v) = n.as_u64() {
                Value::U64(v)
            } else if let Some(v) = n.as_i64() {
                Value::I64(v)
            } else if let Some(v) = n.as_f64() {
                Value::F64(v)
            } else {
                return Err(FrameError::Encoding(format!("unsupported number {n}")));
            }
        }
        other => {
            return Err(FrameError::Encoding(format!(
                "expected a {ty} value, got {other}"
            )))
        }
    };
    coerce(&value, ty)
}

/// Convert a value into JSON. Non-finite floats become `null`.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match *value {
        Value::Bool(v) => v.into(),
        Value::I8(v) => v.into(),
        Value::U8(v) => v.into(),
        Value::I16(v) => v.into(),
        Value::U16(v) => v.into(),
        Value::I32(v) => v.into(),
        Value::U32(v) => v.into(),
        Value::I64(v) => v.into(),
        Value::U64(v) => v.into(),
        Value::F32(v) => float_to_json(f64::from(v)),
        Value::F64(v) => float_to_json(v),
    }
}

fn float_to_json(v: f64) -> serde_json::Value {
    serde_json::Number::from_f64(v)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const TABLE: &str = r#"{
        "speed": {
            "id": 4,
            "direction": "read-write",
            "field_types": ["float32", "uint8"],
            "field_labels": ["rpm", "ramp"],
            "field_units": ["rpm", ""],
            "field_defaults": {"ramp": 3},
            "persistent": true
        },
        "status": {"id": 5, "direction": "read", "field_types": ["uint16", "bool"]}
    }"#;

    #[test]
    fn test_parse_table() {
        let table = EndpointTable::from_json(TABLE).unwrap();
        assert_eq!(table.len(), 2);

        let speed = table.endpoint("speed").unwrap();
        assert_eq!(speed.id, 4);
        assert_eq!(speed.direction, Direction::ReadWrite);
        assert_eq!(speed.fields[0].unit.as_deref(), Some("rpm"));
        assert_eq!(speed.fields[1].unit, None);
        assert_eq!(speed.fields[1].default, Some(Value::U8(3)));
        assert!(speed.persistent);

        let status = table.by_id(5).unwrap();
        assert_eq!(status.name, "status");
        assert_eq!(status.fields[0].name, "field0");
        assert_eq!(status.fields[1].name, "field1");
        assert_eq!(table.persistent().count(), 1);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let json = r#"{"x": {"id": 4, "direction": "read", "field_types": [], "colour": 1}}"#;
        assert!(matches!(EndpointTable::from_json(json), Err(NodeError::Json(_))));
    }

    #[test]
    fn test_reserved_and_duplicate_ids_rejected() {
        let reserved = r#"{"x": {"id": 2, "direction": "read", "field_types": []}}"#;
        assert!(matches!(
            EndpointTable::from_json(reserved),
            Err(NodeError::InvalidTable(_))
        ));

        let too_big = r#"{"x": {"id": 64, "direction": "read", "field_types": []}}"#;
        assert!(matches!(
            EndpointTable::from_json(too_big),
            Err(NodeError::InvalidTable(_))
        ));

        let duplicate = r#"{
            "a": {"id": 4, "direction": "read", "field_types": []},
            "b": {"id": 4, "direction": "write", "field_types": []}
        }"#;
        assert!(matches!(
            EndpointTable::from_json(duplicate),
            Err(NodeError::InvalidTable(_))
        ));
    }

    #[test]
    fn test_payload_limit() {
        let json = r#"{"x": {"id": 4, "direction": "read", "field_types": ["float64", "uint8"]}}"#;
        assert!(EndpointTable::from_json(json).is_err());
        assert!(EndpointTable::from_json_with_limit(json, 64).is_ok());
    }

    #[test]
    fn test_bad_default_rejected() {
        let json = r#"{"x": {"id": 4, "direction": "write", "field_types": ["uint8"],
            "field_defaults": {"field0": 300}}}"#;
        assert!(matches!(
            EndpointTable::from_json(json),
            Err(NodeError::InvalidTable(_))
        ));

        let unknown = r#"{"x": {"id": 4, "direction": "write", "field_types": ["uint8"],
            "field_defaults": {"nope": 1}}}"#;
        assert!(EndpointTable::from_json(unknown).is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let table = EndpointTable::from_json(TABLE).unwrap();
        let reparsed = EndpointTable::from_json(&table.to_json().unwrap()).unwrap();
        assert_eq!(reparsed, table);
    }

    #[test]
    fn test_complete_args() {
        let table = EndpointTable::from_json(TABLE).unwrap();
        let speed = table.endpoint("speed").unwrap();

        assert_eq!(
            speed.complete_args(&[Value::F32(10.0)]).unwrap(),
            vec![Value::F32(10.0), Value::U8(3)]
        );
        assert!(matches!(
            speed.complete_args(&[]),
            Err(CallError::MissingArgument { field, .. }) if field == "rpm"
        ));
        assert!(matches!(
            speed.complete_args(&[Value::F32(1.0), Value::U8(1), Value::U8(2)]),
            Err(CallError::TooManyArguments { expected: 2, actual: 3, .. })
        ));
    }

    #[test]
    fn test_args_by_name() {
        let table = EndpointTable::from_json(TABLE).unwrap();
        let speed = table.endpoint("speed").unwrap();

        assert_eq!(
            speed.args_by_name(&[("rpm", Value::F32(5.0))]).unwrap(),
            vec![Value::F32(5.0), Value::U8(3)]
        );
        assert!(matches!(
            speed.args_by_name(&[("torque", Value::F32(5.0))]),
            Err(CallError::UnknownField { .. })
        ));
    }

    #[test]
    fn test_value_json_conversion() {
        assert_eq!(
            value_from_json(&json!(7), PrimitiveType::Int16).unwrap(),
            Value::I16(7)
        );
        assert_eq!(
            value_from_json(&json!(-2), PrimitiveType::Float32).unwrap(),
            Value::F32(-2.0)
        );
        assert_eq!(
            value_from_json(&json!(true), PrimitiveType::Bool).unwrap(),
            Value::Bool(true)
        );
        assert!(value_from_json(&json!(1.5), PrimitiveType::UInt8).is_err());
        assert!(value_from_json(&json!("1"), PrimitiveType::UInt8).is_err());

        assert_eq!(value_to_json(&Value::U16(9)), json!(9));
        assert_eq!(value_to_json(&Value::F32(0.5)), json!(0.5));
        assert_eq!(value_to_json(&Value::F64(f64::NAN)), serde_json::Value::Null);
    }

    #[test]
    fn test_direction_names() {
        let parsed: Direction = serde_json::from_value(json!("read-write")).unwrap();
        assert_eq!(parsed, Direction::ReadWrite);
        assert!(parsed.can_read() && parsed.can_write());
        assert!(!Direction::Read.can_write());
        assert_eq!(Direction::Write.as_str(), "write");
    }
}
