//! Rollback and error classification

use std::collections::HashSet;
use std::fs;
use std::sync::Arc;

use ipnet::Ipv4Net;
use wg_peerd::driver::DriverOp;
use wg_peerd::peer::{PeerError, PeerErrorKind};

use super::{TestEnv, BASE_CONF};

// ============================================================================
// Create Rollback
// ============================================================================

#[tokio::test]
async fn test_name_exists_has_no_side_effects() {
    let env = TestEnv::new();
    env.manager.create_peer("alice").await.unwrap();
    let conf_before = env.conf_text();
    let registry_before = env.registry_text();
    let keys_before = env.driver.call_count(DriverOp::Keys);

    let err = env.manager.create_peer("alice").await.unwrap_err();
    assert_eq!(err.kind(), PeerErrorKind::NameExists);
    assert!(!err.is_recoverable());

    assert_eq!(env.driver.peer_count(), 1);
    assert_eq!(env.driver.call_count(DriverOp::Keys), keys_before);
    assert_eq!(env.conf_text(), conf_before);
    assert_eq!(env.registry_text(), registry_before);
}

#[tokio::test]
async fn test_config_write_failure_removes_runtime_peer() {
    let env = TestEnv::new();
    fs::remove_file(env.conf_path()).unwrap();
    fs::create_dir(env.conf_path()).unwrap();

    let err = env.manager.create_peer("alice").await.unwrap_err();
    assert_eq!(err.kind(), PeerErrorKind::PersistFailed);
    assert!(err.warnings().is_empty());

    assert_eq!(env.driver.peer_count(), 0);
    assert_eq!(env.driver.call_count(DriverOp::RemovePeer), 1);
    assert!(env.manager.registry().load().unwrap().is_empty());
    assert!(!env.config.storage.clients_dir().join("alice.conf").exists());
}

#[tokio::test]
async fn test_failed_compensation_is_reported() {
    let env = TestEnv::new();
    fs::remove_file(env.conf_path()).unwrap();
    fs::create_dir(env.conf_path()).unwrap();
    env.driver.fail(DriverOp::RemovePeer);

    let err = env.manager.create_peer("alice").await.unwrap_err();
    let PeerError::PersistFailed {
        compensation_warning: Some(warning),
        ..
    } = &err
    else {
        panic!("expected PersistFailed with a warning, got {err:?}");
    };
    assert!(warning.contains("could not be removed"));
    assert_eq!(err.warnings().len(), 1);

    // The runtime peer is left for an operator to clean up
    assert_eq!(env.driver.peer_count(), 1);
    assert!(env.manager.registry().load().unwrap().is_empty());
}

#[tokio::test]
async fn test_interface_down_rejects_create() {
    let env = TestEnv::new();
    env.driver.fail(DriverOp::SetPeer);

    let err = env.manager.create_peer("alice").await.unwrap_err();
    assert_eq!(err.kind(), PeerErrorKind::RuntimeApplyFailed);
    assert!(err.is_recoverable());
    assert_eq!(env.conf_text(), BASE_CONF);
    assert!(env.registry_text().is_empty());
}

#[tokio::test]
async fn test_subnet_exhaustion() {
    let env = TestEnv::with_config(|config| {
        config.interface.subnet = "10.0.70.0/30".parse::<Ipv4Net>().unwrap();
    });

    env.manager.create_peer("alice").await.unwrap();
    let err = env.manager.create_peer("bob").await.unwrap_err();
    assert_eq!(err.kind(), PeerErrorKind::NoFreeAddress);
    assert_eq!(env.driver.peer_count(), 1);
    assert_eq!(env.manager.registry().load().unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_names_rejected() {
    let env = TestEnv::new();
    let long = "x".repeat(33);
    for name in ["a", "has space", "semi;colon", "../etc", long.as_str()] {
        let err = env.manager.create_peer(name).await.unwrap_err();
        assert_eq!(err.kind(), PeerErrorKind::InvalidName, "name {name:?}");
    }
    assert_eq!(env.driver.call_count(DriverOp::Keys), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_registry_write_failure_is_repaired() {
    let env = TestEnv::with_config(|config| {
        config.storage.registry_path = Some(config.storage.data_dir.join("registry/peers.json"));
    });
    let registry_dir = env.config.storage.data_dir.join("registry");

    // A dangling symlink reads as an empty registry but cannot be written
    fs::remove_dir(&registry_dir).unwrap();
    std::os::unix::fs::symlink(env.dir.path().join("missing"), &registry_dir).unwrap();

    let err = env.manager.create_peer("alice").await.unwrap_err();
    assert_eq!(err.kind(), PeerErrorKind::RegistryWriteFailed);

    // Runtime peer and config block stay for repair
    assert_eq!(env.driver.peer_count(), 1);
    let blocks = env.manager.conf_file().blocks().unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].name, "alice");
    assert_eq!(env.manager.audit().await.unwrap().orphan_blocks.len(), 1);

    fs::remove_file(&registry_dir).unwrap();
    fs::create_dir(&registry_dir).unwrap();

    let repaired = env.manager.repair().await.unwrap();
    assert_eq!(repaired.adopted.len(), 1);
    assert_eq!(repaired.adopted[0].name, "alice");
    assert_eq!(repaired.adopted[0].public_key, blocks[0].public_key);
    assert_eq!(repaired.adopted[0].address.to_string(), "10.0.70.2");
    assert!(!repaired.adopted[0].blocked);
    assert!(env.manager.audit().await.unwrap().is_clean());
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_are_serialized() {
    let env = Arc::new(TestEnv::new());

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let env = Arc::clone(&env);
            tokio::spawn(async move { env.manager.create_peer(&format!("peer-{i}")).await })
        })
        .collect();

    let mut created = Vec::new();
    for handle in handles {
        created.push(handle.await.unwrap().unwrap());
    }

    let names: HashSet<_> = created.iter().map(|c| c.record.name.clone()).collect();
    let addresses: HashSet<_> = created.iter().map(|c| c.record.address).collect();
    let keys: HashSet<_> = created.iter().map(|c| c.record.public_key.clone()).collect();
    assert_eq!(names.len(), 16);
    assert_eq!(addresses.len(), 16);
    assert_eq!(keys.len(), 16);

    let records = env.manager.registry().load().unwrap();
    assert_eq!(records.len(), 16);
    assert_eq!(env.manager.conf_file().blocks().unwrap().len(), 16);
    assert!(env.manager.audit().await.unwrap().is_clean());
}

// ============================================================================
// Corrupt Stores
// ============================================================================

#[tokio::test]
async fn test_corrupt_registry_blocks_mutations() {
    let env = TestEnv::new();
    let key = env.manager.create_peer("alice").await.unwrap().record.public_key;
    fs::write(env.manager.registry().path(), "[{\"name\":").unwrap();

    for err in [
        env.manager.create_peer("bob").await.unwrap_err(),
        env.manager.block_peer(&key).await.unwrap_err(),
        env.manager.delete_peer(&key).await.unwrap_err(),
    ] {
        assert_eq!(err.kind(), PeerErrorKind::RegistryReadFailed);
    }
    assert_eq!(
        env.manager.list_peers().await.unwrap_err().kind(),
        PeerErrorKind::RegistryReadFailed
    );

    // Nothing was overwritten
    assert_eq!(env.registry_text(), "[{\"name\":");
    assert_eq!(env.driver.peer_count(), 1);
}

#[tokio::test]
async fn test_legacy_registry_field_names() {
    let env = TestEnv::new();
    fs::write(
        env.manager.registry().path(),
        r#"[{"name":"legacy","pub":"bGVnYWN5LXB1YmxpYy1rZXktcGxhY2Vob2xkZXIwMDA=","ip":"10.0.70.2","created":1700000000000}]"#,
    )
    .unwrap();

    let created = env.manager.create_peer("fresh").await.unwrap();
    assert_eq!(created.record.address.to_string(), "10.0.70.3");

    let records = env.manager.registry().load().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].name, "legacy");
    assert!(!records[0].blocked);
}
