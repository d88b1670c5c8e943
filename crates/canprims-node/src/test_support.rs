use std::sync::Arc;
use std::time::Duration;

use canprims_bus::{BusManager, Router, VirtualBus};

use crate::endpoint::EndpointTable;
use crate::node::NodeConfig;
use crate::transfer::TransferConfig;

pub(crate) const TABLE_JSON: &str = r#"{
    "motor_speed": {
        "id": 4,
        "direction": "read",
        "field_types": ["float32"],
        "field_labels": ["rpm"],
        "field_units": ["rpm"]
    },
    "target_speed": {
        "id": 5,
        "direction": "read-write",
        "field_types": ["float32", "uint16"],
        "field_labels": ["rpm", "ramp_ms"],
        "field_units": ["rpm", "ms"],
        "field_defaults": {"ramp_ms": 250},
        "persistent": true
    },
    "current_limit": {
        "id": 6,
        "direction": "read-write",
        "field_types": ["uint16"],
        "field_labels": ["milliamps"],
        "persistent": true
    },
    "reset": {
        "id": 7,
        "direction": "write",
        "field_types": ["bool"],
        "field_defaults": {"field0": true}
    }
}"#;

pub(crate) fn table() -> Arc<EndpointTable> {
    Arc::new(EndpointTable::from_json(TABLE_JSON).unwrap())
}

pub(crate) fn fast_transfer() -> TransferConfig {
    TransferConfig {
        inactivity_timeout: Duration::from_millis(500),
        ..TransferConfig::default()
    }
}

pub(crate) fn fast_node_config() -> NodeConfig {
    NodeConfig {
        reply_timeout: Duration::from_millis(300),
        probe_attempts: 2,
        transfer: fast_transfer(),
    }
}

/// Two routers on one virtual bus: the host side and a device side.
pub(crate) struct Harness {
    pub bus: VirtualBus,
    pub host: Arc<Router>,
    pub device: Arc<Router>,
}

impl Harness {
    pub fn new() -> Self {
        let bus = VirtualBus::new();
        let host = Router::start(Arc::new(BusManager::new(bus.connector()))).unwrap();
        let device = Router::start(Arc::new(BusManager::new(bus.connector()))).unwrap();
        Self {
            bus,
            host: Arc::new(host),
            device: Arc::new(device),
        }
    }
}
