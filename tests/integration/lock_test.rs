// tests/integration/lock_test.rs

//! Integration tests for lock admission, grants, queueing and release

use super::test_helpers::{TestDaemon, assert_answer};
use flomd::core::protocol::{Message, ReplyCode, ResourceRequest, Verb};
use flomd::core::resource::LockMode;
use std::time::Duration;

// ===== Simple resources =====

#[tokio::test]
async fn test_lock_granted_on_new_resource() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.connect().await;

    let answer = client.lock_name("printer").await;
    assert_answer(&answer, 16, ReplyCode::Ok);
    assert!(daemon.wait_until(|d| d.locker_count() == 1).await);
}

#[tokio::test]
async fn test_waiter_granted_after_unlock() {
    let daemon = TestDaemon::start().await;
    let mut holder = daemon.connect().await;
    let mut waiter = daemon.connect().await;

    assert_answer(&holder.lock_name("printer").await, 16, ReplyCode::Ok);
    assert_answer(&waiter.lock_name("printer").await, 16, ReplyCode::Enqueued);

    holder.unlock("printer").await;

    let grant = waiter.recv().await;
    assert_answer(&grant, 24, ReplyCode::Ok);
}

#[tokio::test]
async fn test_busy_when_not_waiting() {
    let daemon = TestDaemon::start().await;
    let mut holder = daemon.connect().await;
    let mut other = daemon.connect().await;

    assert_answer(&holder.lock_name("printer").await, 16, ReplyCode::Ok);

    let mut request = ResourceRequest::new("printer");
    request.wait = false;
    assert_answer(&other.lock(request).await, 16, ReplyCode::Busy);
}

#[tokio::test]
async fn test_compatible_modes_share_the_resource() {
    let daemon = TestDaemon::start().await;
    let mut first = daemon.connect().await;
    let mut second = daemon.connect().await;

    let mut request = ResourceRequest::new("catalog");
    request.mode = LockMode::ConcurrentRead;
    assert_answer(&first.lock(request.clone()).await, 16, ReplyCode::Ok);
    assert_answer(&second.lock(request).await, 16, ReplyCode::Ok);
}

#[tokio::test]
async fn test_disconnect_releases_lock_to_waiter() {
    let daemon = TestDaemon::start().await;
    let mut holder = daemon.connect().await;
    let mut waiter = daemon.connect().await;

    assert_answer(&holder.lock_name("printer").await, 16, ReplyCode::Ok);
    assert_answer(&waiter.lock_name("printer").await, 16, ReplyCode::Enqueued);

    drop(holder);

    assert_answer(&waiter.recv().await, 24, ReplyCode::Ok);
}

#[tokio::test]
async fn test_relock_after_unlock_on_same_connection() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.connect().await;

    assert_answer(&client.lock_name("printer").await, 16, ReplyCode::Ok);
    client.unlock("printer").await;
    assert_answer(&client.lock_name("printer").await, 16, ReplyCode::Ok);
}

#[tokio::test]
async fn test_second_lock_while_queued_is_refused() {
    let daemon = TestDaemon::start().await;
    let mut holder = daemon.connect().await;
    let mut waiter = daemon.connect().await;
    let mut latecomer = daemon.connect().await;

    assert_answer(&holder.lock_name("printer").await, 16, ReplyCode::Ok);
    assert_answer(&waiter.lock_name("printer").await, 16, ReplyCode::Enqueued);
    assert_answer(&waiter.lock_name("printer").await, 16, ReplyCode::Impossible);

    holder.unlock("printer").await;
    assert_answer(&waiter.recv().await, 24, ReplyCode::Ok);
    assert!(waiter.try_recv(Duration::from_millis(100)).await.is_none());
    drop(waiter);

    // The resource is free again once the waiter is gone.
    let answer = latecomer.lock_name("printer").await;
    if answer.reply_code() == Some(ReplyCode::Enqueued) {
        assert_answer(&latecomer.recv().await, 24, ReplyCode::Ok);
    } else {
        assert_answer(&answer, 16, ReplyCode::Ok);
    }
}

// ===== Other resource kinds =====

#[tokio::test]
async fn test_numeric_resource_capacity() {
    let daemon = TestDaemon::start().await;
    let mut first = daemon.connect().await;
    let mut second = daemon.connect().await;
    let mut third = daemon.connect().await;

    let mut request = ResourceRequest::new("pool[3]");
    request.quantity = 2;
    assert_answer(&first.lock(request.clone()).await, 16, ReplyCode::Ok);

    request.wait = false;
    assert_answer(&second.lock(request).await, 16, ReplyCode::Busy);

    let mut request = ResourceRequest::new("pool[3]");
    request.quantity = 4;
    assert_answer(&third.lock(request).await, 16, ReplyCode::Impossible);
}

#[tokio::test]
async fn test_sequence_hands_out_increasing_values() {
    let daemon = TestDaemon::start().await;
    let mut first = daemon.connect().await;
    let mut second = daemon.connect().await;

    let a = assert_answer(&first.lock_name("_s_ids[5]").await, 16, ReplyCode::Ok);
    let b = assert_answer(&second.lock_name("_s_ids[5]").await, 16, ReplyCode::Ok);
    assert_eq!(a.as_deref(), Some("1"));
    assert_eq!(b.as_deref(), Some("2"));
}

#[tokio::test]
async fn test_set_hands_out_distinct_elements() {
    let daemon = TestDaemon::start().await;
    let mut first = daemon.connect().await;
    let mut second = daemon.connect().await;
    let mut third = daemon.connect().await;

    let a = assert_answer(&first.lock_name("red.green").await, 16, ReplyCode::Ok);
    let b = assert_answer(&second.lock_name("red.green").await, 16, ReplyCode::Ok);
    assert_eq!(a.as_deref(), Some("red"));
    assert_eq!(b.as_deref(), Some("green"));

    assert_answer(&third.lock_name("red.green").await, 16, ReplyCode::Enqueued);
    first.unlock("red.green").await;
    let c = assert_answer(&third.recv().await, 24, ReplyCode::Ok);
    assert_eq!(c.as_deref(), Some("red"));
}

#[tokio::test]
async fn test_hierarchical_paths_share_one_locker() {
    let daemon = TestDaemon::start().await;
    let mut users = daemon.connect().await;
    let mut orders = daemon.connect().await;
    let mut root = daemon.connect().await;

    assert_answer(&users.lock_name("/db/users").await, 16, ReplyCode::Ok);
    assert_answer(&orders.lock_name("/db/orders").await, 16, ReplyCode::Ok);
    assert_answer(&root.lock_name("/db").await, 16, ReplyCode::Enqueued);
    assert_eq!(daemon.locker_count(), 1);

    users.unlock("/db/users").await;
    orders.unlock("/db/orders").await;
    assert_answer(&root.recv().await, 24, ReplyCode::Ok);
}

#[tokio::test]
async fn test_timestamps_are_unique_per_second() {
    let daemon = TestDaemon::start().await;
    let mut first = daemon.connect().await;
    let mut second = daemon.connect().await;

    let a = assert_answer(&first.lock_name("_t_%s[2]").await, 16, ReplyCode::Ok);
    let answer = second.lock_name("_t_%s[2]").await;
    // Within the same second the second requester waits for the clock.
    let b = if answer.reply_code() == Some(ReplyCode::Enqueued) {
        assert_answer(&second.recv().await, 24, ReplyCode::Ok)
    } else {
        assert_answer(&answer, 16, ReplyCode::Ok)
    };

    let a: u64 = a.unwrap().parse().unwrap();
    let b: u64 = b.unwrap().parse().unwrap();
    assert!(b > a, "{b} should follow {a}");
}

// ===== Admission failures =====

#[tokio::test]
async fn test_invalid_name_is_rejected_and_closed() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.connect().await;

    let answer = client.lock_name("not a name!").await;
    assert_answer(&answer, 16, ReplyCode::InvalidResourceName);
    assert!(client.is_closed_by_peer().await);
    assert_eq!(daemon.locker_count(), 0);
}

#[tokio::test]
async fn test_missing_resource_without_wait_is_rejected() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.connect().await;

    let mut request = ResourceRequest::new("absent");
    request.create = false;
    request.wait = false;
    assert_answer(&client.lock(request).await, 16, ReplyCode::CantWait);
    assert!(client.is_closed_by_peer().await);
}

#[tokio::test]
async fn test_zero_capacity_fails_initialization() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.connect().await;

    let answer = client.lock_name("pool[0]").await;
    assert_answer(&answer, 16, ReplyCode::ResourceInitFailed);
    assert!(client.is_closed_by_peer().await);
    assert_eq!(daemon.locker_count(), 0);
}

#[tokio::test]
async fn test_concurrent_creates_start_one_locker() {
    let daemon = TestDaemon::start().await;
    let mut clients = Vec::new();
    for _ in 0..5 {
        clients.push(daemon.connect().await);
    }

    for client in clients.iter_mut() {
        let mut request = ResourceRequest::new("shared");
        request.mode = LockMode::ConcurrentRead;
        client.send(Message::lock_request(request, None)).await;
    }
    for client in clients.iter_mut() {
        assert_answer(&client.recv().await, 16, ReplyCode::Ok);
    }
    assert_eq!(daemon.locker_count(), 1);
}

// ===== Protocol handling =====

#[tokio::test]
async fn test_ping() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.connect().await;

    client.send(Message::ping()).await;
    let answer = client.recv().await;
    assert_eq!(answer.verb, Verb::Ping);
    assert_eq!(answer.step, 16);
    assert_eq!(answer.reply_code(), Some(ReplyCode::Ok));
}

#[tokio::test]
async fn test_level_mismatch_closes_connection() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.connect().await;

    let mut message = Message::lock_request(ResourceRequest::new("printer"), None);
    message.level = 99;
    client.send(message).await;
    assert!(client.is_closed_by_peer().await);
}

#[tokio::test]
async fn test_lock_for_another_resource_is_a_protocol_error() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.connect().await;

    assert_answer(&client.lock_name("printer").await, 16, ReplyCode::Ok);
    let answer = client.lock_name("scanner").await;
    assert_answer(&answer, 16, ReplyCode::ProtocolError);
    assert!(client.is_closed_by_peer().await);
}

#[tokio::test]
async fn test_lock_over_unix_socket() {
    let daemon = TestDaemon::on_unix_socket().await;
    let mut client = daemon.connect_unix().await;

    assert_answer(&client.lock_name("printer").await, 16, ReplyCode::Ok);
    assert!(client.try_recv(Duration::from_millis(100)).await.is_none());
}
