//! Discovery, endpoint calls and a firmware upload against emulated nodes.
//!
//! Run with:
//!   cargo run -p canprims --example virtual-node --features logging
//!
//! Two emulated nodes share an in-process bus with the host. The host
//! discovers them from their announcements, pulls each endpoint table,
//! drives a few endpoints and uploads a small firmware image.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use canprims::bus::{BusManager, Router, VirtualBus};
use canprims::frame::Value;
use canprims::logging::{init_logging, LogFormat, LogLevel};
use canprims::node::{
    Discovery, DiscoveryConfig, EndpointSource, EndpointTable, NodeResponder, ResponderConfig,
};

const TABLE: &str = r#"{
    "motor_speed": {"id": 4, "direction": "read", "field_types": ["float32"],
                    "field_labels": ["rpm"], "field_units": ["rpm"]},
    "target_speed": {"id": 5, "direction": "read-write", "field_types": ["float32", "uint16"],
                     "field_labels": ["rpm", "ramp_ms"], "field_defaults": {"ramp_ms": 250},
                     "persistent": true}
}"#;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let level = std::env::var("CANPRIMS_LOG")
        .ok()
        .and_then(|level| level.parse().ok())
        .unwrap_or(LogLevel::Info);
    init_logging(LogFormat::Text, level);

    let bus = VirtualBus::new();
    let table = Arc::new(EndpointTable::from_json(TABLE)?);

    let device_router = Arc::new(Router::start(Arc::new(BusManager::new(bus.connector())))?);
    let _nodes = [1u8, 2]
        .into_iter()
        .map(|node_id| {
            NodeResponder::start(
                Arc::clone(&device_router),
                node_id,
                Arc::clone(&table),
                ResponderConfig {
                    serial_number: 0x1000 + u32::from(node_id),
                    ..ResponderConfig::default()
                },
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    let host_router = Arc::new(Router::start(Arc::new(BusManager::new(bus.connector())))?);
    let (found_tx, found_rx) = mpsc::channel();
    let discovery = Discovery::start(
        Arc::clone(&host_router),
        EndpointSource::Remote,
        DiscoveryConfig::default(),
        move |node, node_id| {
            let _ = found_tx.send((node_id, node));
        },
        |node_id| eprintln!("node {node_id} disappeared"),
    )?;

    for _ in 0..2 {
        let (node_id, node) = found_rx.recv_timeout(Duration::from_secs(5))?;
        eprintln!("node {node_id}: {} endpoints", node.table().len());

        let committed = node.call("target_speed", &[Value::F32(1500.0)])?;
        eprintln!("node {node_id}: target_speed committed {committed:?}");
        eprintln!("node {node_id}: motor_speed = {:?}", node.read("motor_speed")?);

        let config = node.export_config()?;
        eprintln!("node {node_id}: config {}", serde_json::to_string(&config)?);

        node.upload_firmware(vec![0xA5; 100])?;
        eprintln!("node {node_id}: firmware uploaded");
    }

    eprintln!("known nodes: {:?}", discovery.known_nodes());
    Ok(())
}
