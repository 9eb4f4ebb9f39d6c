//! Peer lifecycle across interface, registry and config file

use std::fs;
use std::net::Ipv4Addr;

use wg_peerd::peer::snapshot::BLOCKED_ALLOWED_ADDRESS;
use wg_peerd::peer::{validate_wg_key, PeerErrorKind};

use super::{TestEnv, BASE_CONF};

// ============================================================================
// Address Allocation
// ============================================================================

#[tokio::test]
async fn test_addresses_are_reused_lowest_first() {
    let env = TestEnv::new();

    let alice = env.manager.create_peer("alice").await.unwrap();
    let bob = env.manager.create_peer("bob").await.unwrap();
    assert_eq!(alice.record.address, Ipv4Addr::new(10, 0, 70, 2));
    assert_eq!(bob.record.address, Ipv4Addr::new(10, 0, 70, 3));

    env.manager.delete_peer(&alice.record.public_key).await.unwrap();

    let carol = env.manager.create_peer("carol").await.unwrap();
    assert_eq!(carol.record.address, Ipv4Addr::new(10, 0, 70, 2));

    let names: Vec<String> = env
        .manager
        .registry()
        .load()
        .unwrap()
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names, vec!["bob".to_string(), "carol".to_string()]);
}

// ============================================================================
// Create
// ============================================================================

#[tokio::test]
async fn test_create_produces_usable_client_config() {
    let env = TestEnv::new();
    let created = env.manager.create_peer("laptop").await.unwrap();

    validate_wg_key(&created.bundle.private_key).unwrap();
    validate_wg_key(&created.bundle.public_key).unwrap();
    validate_wg_key(&created.bundle.preshared_key).unwrap();

    let text = created.bundle.render();
    assert!(text.contains("Address = 10.0.70.2/24"));
    assert!(text.contains("Endpoint = vpn.example.com:51820"));
    assert!(text.contains(&format!("PresharedKey = {}", created.bundle.preshared_key)));

    let stored = env.manager.client_config(&created.record.public_key).unwrap();
    assert_eq!(stored, text);
}

#[tokio::test]
async fn test_create_keeps_hand_written_config() {
    let env = TestEnv::new();
    let created = env.manager.create_peer("alice").await.unwrap();

    let conf = env.conf_text();
    assert!(conf.starts_with(BASE_CONF));
    assert!(conf.contains(&format!("PublicKey = {}", created.record.public_key)));
    assert!(conf.contains("AllowedIPs = 10.0.70.2/32"));

    let blocks = env.manager.conf_file().blocks().unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].public_key, created.record.public_key);
    assert_eq!(blocks[0].preshared_key, created.bundle.preshared_key);
}

// ============================================================================
// Block / Unblock
// ============================================================================

#[tokio::test]
async fn test_block_unblock_toggle() {
    let env = TestEnv::new();
    let key = env.manager.create_peer("alice").await.unwrap().record.public_key;

    let blocked = env.manager.block_peer(&key).await.unwrap();
    assert!(blocked.record.blocked);
    assert_eq!(
        env.driver.peer(&key).unwrap().allowed_addresses,
        vec![BLOCKED_ALLOWED_ADDRESS.to_string()]
    );
    assert!(env.manager.registry().load().unwrap()[0].blocked);

    // The config block keeps the real address so a restart can restore it
    assert!(env.conf_text().contains("AllowedIPs = 10.0.70.2/32"));

    let snapshot = env.manager.get_peer(&key).await.unwrap();
    assert!(snapshot.blocked);
    assert_eq!(snapshot.allowed_addresses, vec!["10.0.70.2/32".to_string()]);
    assert_eq!(
        snapshot.runtime_allowed_addresses,
        vec![BLOCKED_ALLOWED_ADDRESS.to_string()]
    );

    let unblocked = env.manager.unblock_peer(&key).await.unwrap();
    assert!(!unblocked.record.blocked);
    assert_eq!(
        env.driver.peer(&key).unwrap().allowed_addresses,
        vec!["10.0.70.2/32".to_string()]
    );
    assert!(!env.manager.registry().load().unwrap()[0].blocked);
}

#[tokio::test]
async fn test_blocked_peer_survives_restart() {
    let env = TestEnv::new();
    let key = env.manager.create_peer("alice").await.unwrap().record.public_key;
    env.manager.block_peer(&key).await.unwrap();

    env.manager.restart_interface().await.unwrap();
    assert!(env.driver.is_up());
    assert_eq!(
        env.driver.peer(&key).unwrap().allowed_addresses,
        vec![BLOCKED_ALLOWED_ADDRESS.to_string()]
    );
}

// ============================================================================
// Delete
// ============================================================================

#[tokio::test]
async fn test_delete_removes_everything() {
    let env = TestEnv::new();
    let created = env.manager.create_peer("alice").await.unwrap();
    let key = created.record.public_key.clone();

    let outcome = env.manager.delete_peer(&key).await.unwrap();
    assert!(outcome.warnings.is_empty());
    assert_eq!(outcome.record.name, "alice");

    assert!(env.driver.peer(&key).is_none());
    assert!(env.manager.registry().load().unwrap().is_empty());
    assert_eq!(env.conf_text(), BASE_CONF);
    assert!(!created.client_config_path.unwrap().exists());
}

#[tokio::test]
async fn test_delete_twice_is_not_found() {
    let env = TestEnv::new();
    let key = env.manager.create_peer("alice").await.unwrap().record.public_key;
    env.manager.create_peer("bob").await.unwrap();
    env.manager.delete_peer(&key).await.unwrap();

    let conf_before = env.conf_text();
    let registry_before = env.registry_text();

    let err = env.manager.delete_peer(&key).await.unwrap_err();
    assert_eq!(err.kind(), PeerErrorKind::NotFound);
    assert_eq!(env.conf_text(), conf_before);
    assert_eq!(env.registry_text(), registry_before);
    assert_eq!(env.driver.peer_count(), 1);
}

#[tokio::test]
async fn test_delete_leaves_unmanaged_client_files() {
    let env = TestEnv::new();
    let key = env.manager.create_peer("alice").await.unwrap().record.public_key;
    let other = env.config.storage.clients_dir().join("notes.txt");
    fs::write(&other, "keep").unwrap();

    env.manager.delete_peer(&key).await.unwrap();
    assert_eq!(fs::read_to_string(other).unwrap(), "keep");
}

// ============================================================================
// Consistency
// ============================================================================

#[tokio::test]
async fn test_audit_clean_through_lifecycle() {
    let env = TestEnv::new();
    let alice = env.manager.create_peer("alice").await.unwrap().record.public_key;
    let bob = env.manager.create_peer("bob").await.unwrap().record.public_key;
    env.manager.block_peer(&bob).await.unwrap();
    env.manager.delete_peer(&alice).await.unwrap();

    let report = env.manager.audit().await.unwrap();
    assert!(report.is_clean(), "unexpected drift: {report:?}");
}

#[tokio::test]
async fn test_dot_names_are_valid_peers() {
    let env = TestEnv::new();
    let created = env.manager.create_peer("..").await.unwrap();

    let path = created.client_config_path.unwrap();
    assert_eq!(path, env.config.storage.clients_dir().join("...conf"));
    assert!(path.exists());

    env.manager.delete_peer(&created.record.public_key).await.unwrap();
    assert!(!path.exists());
}

#[tokio::test]
async fn test_several_blocked_peers_audit_clean() {
    let env = TestEnv::new();
    let alice = env.manager.create_peer("alice").await.unwrap().record.public_key;
    let bob = env.manager.create_peer("bob").await.unwrap().record.public_key;
    env.manager.block_peer(&alice).await.unwrap();
    env.manager.block_peer(&bob).await.unwrap();

    // Only one peer can hold the null route at a time
    assert!(env.driver.peer(&alice).unwrap().allowed_addresses.is_empty());
    assert_eq!(
        env.driver.peer(&bob).unwrap().allowed_addresses,
        vec![BLOCKED_ALLOWED_ADDRESS.to_string()]
    );

    let report = env.manager.audit().await.unwrap();
    assert!(report.is_clean(), "unexpected drift: {report:?}");

    // An orphaned blocked peer without the route is still adopted as blocked
    let records = env.manager.registry().load().unwrap();
    env.manager.registry().save(&records[1..]).unwrap();
    let repaired = env.manager.repair().await.unwrap();
    assert_eq!(repaired.adopted.len(), 1);
    assert_eq!(repaired.adopted[0].public_key, alice);
    assert!(repaired.adopted[0].blocked);
}
