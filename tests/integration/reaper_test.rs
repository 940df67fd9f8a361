// tests/integration/reaper_test.rs

//! Integration tests for idle locker reaping and the daemon idle lifespan

use super::test_helpers::{TestDaemon, assert_answer, tcp_config};
use flomd::config::Config;
use flomd::core::protocol::ReplyCode;
use std::time::Duration;

fn fast_reaping() -> Config {
    Config {
        locker_idle_periods: 1,
        locker_sweep_interval: Duration::from_millis(20),
        ..tcp_config()
    }
}

#[tokio::test]
async fn test_idle_locker_is_reaped() {
    let daemon = TestDaemon::with_config(fast_reaping()).await;
    let mut client = daemon.connect().await;

    assert_answer(&client.lock_name("printer").await, 16, ReplyCode::Ok);
    client.unlock("printer").await;
    drop(client);

    assert!(daemon.wait_until(|d| d.locker_count() == 0).await);
}

#[tokio::test]
async fn test_locker_with_connections_survives_sweeps() {
    let daemon = TestDaemon::with_config(fast_reaping()).await;
    let mut client = daemon.connect().await;

    assert_answer(&client.lock_name("printer").await, 16, ReplyCode::Ok);
    client.unlock("printer").await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(daemon.locker_count(), 1);
    assert_answer(&client.lock_name("printer").await, 16, ReplyCode::Ok);
}

#[tokio::test]
async fn test_resource_recreated_after_reaping() {
    let daemon = TestDaemon::with_config(fast_reaping()).await;

    let mut first = daemon.connect().await;
    let value = assert_answer(&first.lock_name("_s_ids[2]").await, 16, ReplyCode::Ok);
    assert_eq!(value.as_deref(), Some("1"));
    drop(first);
    assert!(daemon.wait_until(|d| d.locker_count() == 0).await);

    // A fresh locker starts the sequence over.
    let mut second = daemon.connect().await;
    let value = assert_answer(&second.lock_name("_s_ids[2]").await, 16, ReplyCode::Ok);
    assert_eq!(value.as_deref(), Some("1"));
}

#[tokio::test]
async fn test_daemon_exits_after_idle_lifespan() {
    let config = Config {
        idle_lifespan: Duration::from_millis(150),
        ..tcp_config()
    };
    let mut daemon = TestDaemon::with_config(config).await;

    assert!(daemon.wait_until(|d| d.handle().is_finished()).await);
    let handle = daemon.handle.take().unwrap();
    assert!(handle.wait().await.is_ok());
}

#[tokio::test]
async fn test_daemon_stays_up_while_clients_are_connected() {
    let config = Config {
        idle_lifespan: Duration::from_millis(150),
        ..tcp_config()
    };
    let daemon = TestDaemon::with_config(config).await;
    let client = daemon.connect().await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!daemon.handle().is_finished());

    drop(client);
    assert!(daemon.wait_until(|d| d.handle().is_finished()).await);
}

#[tokio::test]
async fn test_socket_file_removed_on_exit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flomd.sock");
    let config = Config {
        socket_path: path.to_string_lossy().into_owned(),
        idle_lifespan: Duration::from_millis(100),
        ..Config::default()
    };
    let daemon = TestDaemon::with_config(config).await;
    assert!(path.exists());

    assert!(daemon.wait_until(|d| d.handle().is_finished()).await);
    assert!(!path.exists());
}
