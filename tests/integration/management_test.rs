// tests/integration/management_test.rs

//! Integration tests for the management verb: status and shutdown

use super::test_helpers::{TestDaemon, assert_answer, tcp_config};
use flomd::config::Config;
use flomd::core::protocol::{Body, ManagementAction, ReplyCode, Verb};
use flomd::core::resource::ResourceKind;
use std::time::Duration;

#[tokio::test]
async fn test_status_lists_live_lockers() {
    let daemon = TestDaemon::start().await;
    let mut holder = daemon.connect().await;
    let mut admin = daemon.connect().await;

    assert_answer(&holder.lock_name("printer").await, 16, ReplyCode::Ok);

    let reply = admin.manage(ManagementAction::Status).await;
    assert_eq!(reply.verb, Verb::Management);
    assert_eq!(reply.step, 16);
    match reply.body {
        Body::Status { lockers } => {
            assert_eq!(lockers.len(), 1);
            assert_eq!(lockers[0].name, "printer");
            assert_eq!(lockers[0].kind, ResourceKind::Simple);
            assert_eq!(lockers[0].connections, 1);
        }
        other => panic!("Expected a status body, got {other:?}"),
    }
}

#[tokio::test]
async fn test_status_on_empty_daemon() {
    let daemon = TestDaemon::start().await;
    let mut admin = daemon.connect().await;

    let reply = admin.manage(ManagementAction::Status).await;
    assert_eq!(reply.body, Body::Status { lockers: vec![] });
}

#[tokio::test]
async fn test_immediate_shutdown_stops_daemon() {
    let daemon = TestDaemon::start().await;
    let mut holder = daemon.connect().await;
    let mut admin = daemon.connect().await;

    assert_answer(&holder.lock_name("printer").await, 16, ReplyCode::Ok);

    let reply = admin
        .manage(ManagementAction::Shutdown { immediate: true })
        .await;
    assert_eq!(reply.verb, Verb::Management);
    assert_eq!(reply.reply_code(), Some(ReplyCode::Ok));

    assert!(daemon.wait_until(|d| d.handle().is_finished()).await);
    assert!(holder.is_closed_by_peer().await);
}

#[tokio::test]
async fn test_quiesce_waits_for_clients_to_leave() {
    let config = Config {
        quiesce_grace: Duration::from_millis(100),
        ..tcp_config()
    };
    let daemon = TestDaemon::with_config(config).await;
    let mut holder = daemon.connect().await;
    let mut admin = daemon.connect().await;

    assert_answer(&holder.lock_name("printer").await, 16, ReplyCode::Ok);
    let reply = admin
        .manage(ManagementAction::Shutdown { immediate: false })
        .await;
    assert_eq!(reply.reply_code(), Some(ReplyCode::Ok));
    drop(admin);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!daemon.handle().is_finished());

    drop(holder);
    assert!(daemon.wait_until(|d| d.handle().is_finished()).await);
    assert_eq!(daemon.locker_count(), 0);
}

#[tokio::test]
async fn test_quiesce_keeps_a_shorter_idle_lifespan() {
    let config = Config {
        idle_lifespan: Duration::from_millis(300),
        quiesce_grace: Duration::from_secs(60),
        ..tcp_config()
    };
    let daemon = TestDaemon::with_config(config).await;
    let mut admin = daemon.connect().await;

    let reply = admin
        .manage(ManagementAction::Shutdown { immediate: false })
        .await;
    assert_eq!(reply.reply_code(), Some(ReplyCode::Ok));
    drop(admin);

    assert!(daemon.wait_until(|d| d.handle().is_finished()).await);
}
