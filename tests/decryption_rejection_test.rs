//! A peer introduced under the wrong public key must fail to decrypt, and
//! the malformed delivery must never reach extension dispatch.

mod common;

use std::time::Duration;

use common::{link_with_keys, CaptureExtension, Node};
use driftnet::config::GossipConfig;
use driftnet::protocol::MessageKind;

#[tokio::test]
async fn whisper_encrypted_for_the_wrong_peer_key_is_dropped_undecrypted() {
    let a = Node::new(GossipConfig::default());
    let b = Node::new(GossipConfig::default());
    let c = Node::new(GossipConfig::default());

    // A is told B's public key is actually C's — as if A had mixed up two
    // peer introductions. B still correctly knows A's real key.
    link_with_keys(&a, &b, a.public_key, c.public_key, "a-b").await;

    let capture = CaptureExtension::new("capture-whisper", vec![MessageKind::Whisper]);
    b.orchestrator.register_extension(capture.clone()).await.unwrap();

    let a_handle = a.spawn_run();
    let b_handle = b.spawn_run();

    let accepted_by_transport = a
        .orchestrator
        .whisper(&b.id, "top secret", "default")
        .await
        .unwrap();
    // The transport itself accepts the bytes; only decryption on the far
    // side fails.
    assert!(accepted_by_transport);

    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(
        capture.received().await.is_empty(),
        "a message that fails decryption must never reach extension dispatch"
    );

    common::shutdown_all(vec![a_handle, b_handle]).await;
}
