//! Basic smoke tests confirming the core modules are wired together and
//! behave per the published invariants, without any networking.

use driftnet::config::Config;
use driftnet::identity::{derive_resonance_key, extract_timestamp, generate_node_id, validate_node_id};
use driftnet::protocol::{construct, deserialize, serialize, validate, Body, ConstructOptions};

#[test]
fn generated_node_ids_validate_and_round_trip() {
    let id = generate_node_id().expect("OS RNG available");
    assert!(validate_node_id(id.as_str()));
    assert!(extract_timestamp(id.as_str()).is_ok());
}

#[test]
fn resonance_key_is_32_bytes_and_deterministic() {
    let a = derive_resonance_key("file:sync");
    let b = derive_resonance_key("file:sync");
    assert_eq!(a.len(), 32);
    assert_eq!(a, b);
}

#[test]
fn construct_serialize_deserialize_validate_round_trips() {
    let sender = generate_node_id().unwrap();
    let message = construct(
        sender,
        String::new(),
        Body::Hello,
        ConstructOptions::default(),
    )
    .unwrap();

    let wire = serialize(&message).unwrap();
    let back = deserialize(&wire).unwrap();
    assert!(validate(&back).valid);
}

#[test]
fn default_config_matches_documented_defaults() {
    let config = Config::default();
    assert_eq!(config.connection.timeout_ms, 30_000);
    assert_eq!(config.connection.heartbeat_interval_ms, 30_000);
    assert_eq!(config.gossip.max_hops, 10);
    assert_eq!(config.gossip.interval_ms, 5_000);
    assert_eq!(config.gossip.message_ttl_ms, 300_000);
    assert_eq!(config.gossip.max_concurrent_gossip, 5);
    assert_eq!(config.max_connections, 50);
    assert!(!config.debug);
}
