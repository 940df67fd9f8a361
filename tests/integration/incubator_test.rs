// tests/integration/incubator_test.rs

//! Integration tests for clients waiting on resources that do not exist yet

use super::test_helpers::{TestDaemon, assert_answer};
use flomd::core::protocol::{Message, ReplyCode, ResourceRequest};
use std::time::Duration;

fn wait_for(name: &str) -> ResourceRequest {
    let mut request = ResourceRequest::new(name);
    request.create = false;
    request
}

#[tokio::test]
async fn test_waiting_client_adopted_by_new_locker() {
    let daemon = TestDaemon::start().await;
    let mut waiter = daemon.connect().await;
    let mut creator = daemon.connect().await;

    let answer = waiter.lock(wait_for("slots[2]")).await;
    assert_answer(&answer, 16, ReplyCode::WaitingResource);
    assert_eq!(daemon.locker_count(), 0);

    assert_answer(&creator.lock_name("slots[2]").await, 16, ReplyCode::Ok);
    assert_answer(&waiter.recv().await, 24, ReplyCode::Ok);
    assert_eq!(daemon.locker_count(), 1);
}

#[tokio::test]
async fn test_adopted_client_queues_silently() {
    let daemon = TestDaemon::start().await;
    let mut waiter = daemon.connect().await;
    let mut creator = daemon.connect().await;

    assert_answer(
        &waiter.lock(wait_for("printer")).await,
        16,
        ReplyCode::WaitingResource,
    );
    assert_answer(&creator.lock_name("printer").await, 16, ReplyCode::Ok);

    // Already told it is waiting, so no Enqueued answer follows.
    assert!(waiter.try_recv(Duration::from_millis(200)).await.is_none());

    creator.unlock("printer").await;
    assert_answer(&waiter.recv().await, 24, ReplyCode::Ok);
}

#[tokio::test]
async fn test_waiting_clients_only_adopted_by_their_resource() {
    let daemon = TestDaemon::start().await;
    let mut waiter = daemon.connect().await;
    let mut creator = daemon.connect().await;

    assert_answer(
        &waiter.lock(wait_for("scanner")).await,
        16,
        ReplyCode::WaitingResource,
    );
    assert_answer(&creator.lock_name("printer").await, 16, ReplyCode::Ok);
    assert!(waiter.try_recv(Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn test_message_while_waiting_closes_connection() {
    let daemon = TestDaemon::start().await;
    let mut waiter = daemon.connect().await;

    assert_answer(
        &waiter.lock(wait_for("printer")).await,
        16,
        ReplyCode::WaitingResource,
    );
    waiter.send(Message::ping()).await;
    assert!(waiter.is_closed_by_peer().await);
}
