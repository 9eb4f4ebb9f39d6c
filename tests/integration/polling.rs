//! Snapshot publication and transfer rates

use std::sync::Arc;
use std::time::Duration;

use wg_peerd::driver::DriverOp;

use super::TestEnv;

fn now_secs() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_rates_from_successive_polls() {
    let env = TestEnv::new();
    let key = env.manager.create_peer("alice").await.unwrap().record.public_key;
    let poller = env.manager.poller();

    env.driver.set_transfer(&key, 1000, 400, now_secs());
    poller.tick().await;

    tokio::time::advance(Duration::from_secs(2)).await;
    env.driver.set_transfer(&key, 3000, 1400, now_secs());
    let snapshot = poller.tick().await;

    let peer = snapshot.peer(&key).unwrap();
    assert_eq!(peer.rx_bytes, 3000);
    assert!((peer.rx_rate - 1000.0).abs() < f64::EPSILON);
    assert!((peer.tx_rate - 500.0).abs() < f64::EPSILON);
    assert!(peer.online);
}

#[tokio::test(start_paused = true)]
async fn test_counter_reset_gives_zero_rate() {
    let env = TestEnv::new();
    let key = env.manager.create_peer("alice").await.unwrap().record.public_key;
    let poller = env.manager.poller();

    env.driver.set_transfer(&key, 50_000, 50_000, 0);
    poller.tick().await;

    // Restart zeroes the counters
    env.manager.restart_interface().await.unwrap();
    tokio::time::advance(Duration::from_secs(5)).await;
    env.driver.set_transfer(&key, 100, 100, 0);

    let snapshot = poller.tick().await;
    let peer = snapshot.peer(&key).unwrap();
    assert_eq!((peer.rx_rate, peer.tx_rate), (0.0, 0.0));
    assert!(!peer.online);
}

#[tokio::test]
async fn test_mutations_publish_snapshots() {
    let env = TestEnv::new();
    let mut rx = env.manager.subscribe();
    rx.borrow_and_update();

    let key = env.manager.create_peer("alice").await.unwrap().record.public_key;
    assert!(rx.has_changed().unwrap());
    assert!(rx.borrow_and_update().peer(&key).is_some());

    env.manager.block_peer(&key).await.unwrap();
    assert!(rx.borrow_and_update().peer(&key).unwrap().blocked);

    env.manager.delete_peer(&key).await.unwrap();
    assert!(rx.borrow_and_update().peers.is_empty());
}

#[tokio::test]
async fn test_unmanaged_runtime_peers_are_not_listed() {
    let env = TestEnv::new();
    env.manager.create_peer("alice").await.unwrap();
    env.driver.insert_peer(wg_peerd::PeerRuntimeRow {
        public_key: "manual=".into(),
        endpoint: None,
        allowed_addresses: vec!["10.0.70.250/32".into()],
        latest_handshake: 0,
        rx_bytes: 0,
        tx_bytes: 0,
    });

    let snapshot = env.manager.poller().tick().await;
    assert_eq!(snapshot.peers.len(), 1);
    assert_eq!(env.manager.list_peers().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_interface_down_snapshot() {
    let env = TestEnv::new();
    let key = env.manager.create_peer("alice").await.unwrap().record.public_key;
    env.driver.fail(DriverOp::Dump);
    env.driver.fail(DriverOp::Summary);

    let snapshot = env.manager.poller().tick().await;
    assert!(!snapshot.summary.available);
    assert!(snapshot.runtime_error.is_some());

    // Registry peers are still reported, just not in runtime
    let peer = snapshot.peer(&key).unwrap();
    assert!(!peer.in_runtime);
    assert!(!peer.online);
}

#[tokio::test(start_paused = true)]
async fn test_poll_loop_publishes_until_shutdown() {
    let env = TestEnv::new();
    let poller = Arc::clone(env.manager.poller());
    let mut rx = poller.subscribe();
    rx.borrow_and_update();

    let handle = tokio::spawn(Arc::clone(&poller).run());
    rx.changed().await.unwrap();

    env.manager.create_peer("alice").await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(poller.latest().peers.len(), 1);

    poller.shutdown();
    handle.await.unwrap();
}
