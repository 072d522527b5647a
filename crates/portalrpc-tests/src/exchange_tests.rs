//! Request lifecycle scenarios across client, fabric and service.

use portalrpc_transport::{
    new_cancel_pair, CancelReason, CancelToken, ClientConfig, EventKind, ExchangeState, QueueKind,
    Reply, RpcError, ServiceConfig,
};

use crate::harness::{eventually, EchoBody, TestCluster, OP_ECHO};

#[tokio::test]
async fn test_networked_echo() {
    let cluster = TestCluster::small();
    let _worker = cluster.spawn_echo();
    let reply: Reply<Vec<u8>> = cluster
        .client
        .call(
            OP_ECHO,
            &EchoBody::plain(b"hello portal".to_vec()),
            256,
            &cluster.remote(),
            &CancelToken::never(),
        )
        .await
        .unwrap();
    assert_eq!(reply.body, b"hello portal");
    assert_eq!(reply.header.status, 0);

    let client = cluster.client_transport().metrics().snapshot();
    assert_eq!(client.requests_sent, 1);
    assert_eq!(client.replies_received, 1);
    assert_eq!(cluster.server_transport().metrics().snapshot().replies_sent, 1);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_local_path_matches_network_without_fabric_ops() {
    let cluster = TestCluster::small();
    let _worker = cluster.spawn_echo();
    let body = EchoBody::plain(vec![7; 300]);

    let remote: Reply<Vec<u8>> = cluster
        .client
        .call(OP_ECHO, &body, 512, &cluster.remote(), &CancelToken::never())
        .await
        .unwrap();
    let before = cluster.net.stats();

    let local: Reply<Vec<u8>> = cluster
        .client
        .call(OP_ECHO, &body, 512, &cluster.local(), &CancelToken::never())
        .await
        .unwrap();

    assert_eq!(local.body, remote.body);
    assert_eq!(local.header.status, remote.header.status);
    assert_eq!(local.header.opcode, remote.header.opcode);
    assert_eq!(cluster.net.stats(), before);
    assert_eq!(cluster.client_transport().metrics().snapshot().requests_local, 1);
}

#[tokio::test]
async fn test_cancel_before_any_event_unlinks_once_and_ignores_late_reply() {
    let cluster = TestCluster::small();
    let _worker = cluster.spawn_echo();
    cluster.net.set_hold_deliveries(true);

    let (token, handle) = new_cancel_pair();
    let mut request = cluster
        .client
        .create(OP_ECHO, &EchoBody::plain(vec![1; 16]), 128)
        .unwrap();
    cluster.client.dispatch(&mut request, &cluster.remote()).unwrap();
    handle.cancel(CancelReason::UserRequested);

    let err = cluster
        .client
        .wait::<Vec<u8>>(&mut request, &token)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Cancelled(CancelReason::UserRequested)));
    assert_eq!(cluster.net.stats().unlinks, 1);
    assert_eq!(request.state(), ExchangeState::Aborted);

    // The request reaches the service only now; its reply finds no descriptor.
    assert_eq!(cluster.net.release_held(), 1);
    let server = cluster.server_transport().clone();
    eventually(|| server.metrics().snapshot().replies_sent == 1).await;
    assert_eq!(cluster.net.stats().dropped, 1);
    assert_eq!(cluster.net.stats().unlinks, 1);
    assert_eq!(request.state(), ExchangeState::Aborted);
    assert_eq!(cluster.client_transport().metrics().snapshot().replies_received, 0);
}

#[tokio::test]
async fn test_duplicate_reply_events_have_no_effect() {
    let cluster = TestCluster::with_event_tap(
        ClientConfig::default(),
        ServiceConfig {
            ring_length: 4,
            buffer_size: 4096,
            ..ServiceConfig::default()
        },
        |event| {
            if event.queue == QueueKind::ReplyReceived && event.kind == EventKind::Put {
                let mut dup = event.clone();
                dup.mlength = 1;
                vec![event, dup]
            } else {
                vec![event]
            }
        },
    );
    let _worker = cluster.spawn_echo();

    for round in 0..3u8 {
        let reply: Reply<Vec<u8>> = cluster
            .client
            .call(
                OP_ECHO,
                &EchoBody::plain(vec![round; 40]),
                256,
                &cluster.remote(),
                &CancelToken::never(),
            )
            .await
            .unwrap();
        assert_eq!(reply.body, vec![round; 40]);
    }

    let metrics = cluster.client_transport().metrics().clone();
    eventually(|| metrics.snapshot().stale_events == 3).await;
    assert_eq!(metrics.snapshot().replies_received, 3);
    assert!(cluster.client_transport().is_running());
}

#[tokio::test]
async fn test_exactly_one_outcome_per_wait() {
    let cluster = TestCluster::small();
    let _worker = cluster.spawn_echo();
    let mut replies = 0;
    let mut cancelled = 0;

    for i in 0..40usize {
        let (token, handle) = new_cancel_pair();
        let delay = i % 5;
        tokio::spawn(async move {
            for _ in 0..delay {
                tokio::task::yield_now().await;
            }
            handle.cancel(CancelReason::UserRequested);
        });
        let mut request = cluster
            .client
            .create(OP_ECHO, &EchoBody::plain(vec![i as u8; 8]), 128)
            .unwrap();
        cluster.client.dispatch(&mut request, &cluster.remote()).unwrap();
        match cluster.client.wait::<Vec<u8>>(&mut request, &token).await {
            Ok(reply) => {
                assert_eq!(reply.body, vec![i as u8; 8]);
                assert!(matches!(request.state(), ExchangeState::Replied { .. }));
                replies += 1;
            }
            Err(e) => {
                assert!(e.is_cancellation(), "unexpected error {e}");
                cancelled += 1;
            }
        }
        // A second abort after any outcome is harmless.
        cluster.client.abort(&mut request);
    }

    assert_eq!(replies + cancelled, 40);
    let metrics = cluster.client_transport().metrics().snapshot();
    assert_eq!(metrics.cancelled, cancelled);
}

#[tokio::test]
async fn test_failed_send_completion_fails_the_wait() {
    let cluster = TestCluster::small();
    cluster.net.fail_next_completion(-5);
    let mut request = cluster
        .client
        .create(OP_ECHO, &EchoBody::plain(vec![0; 8]), 128)
        .unwrap();
    cluster.client.dispatch(&mut request, &cluster.remote()).unwrap();
    let err = cluster
        .client
        .wait::<Vec<u8>>(&mut request, &CancelToken::never())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Transport { op: "send", code: -5 }));
    assert!(request.reply_descriptor().is_none());
    assert_eq!(cluster.client_transport().metrics().snapshot().send_failures, 1);
}

#[tokio::test]
async fn test_oversized_remote_reply_is_truncated() {
    let cluster = TestCluster::small();
    let _worker = cluster.spawn_echo();
    let mut request = cluster
        .client
        .create(OP_ECHO, &EchoBody::plain(vec![9; 200]), 64)
        .unwrap();
    cluster.client.dispatch(&mut request, &cluster.remote()).unwrap();
    let err = cluster
        .client
        .wait::<Vec<u8>>(&mut request, &CancelToken::never())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::TruncatedReply { received: 64, .. }));
    assert_eq!(cluster.client_transport().metrics().snapshot().truncated_replies, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_request_times_out() {
    let cluster = TestCluster::start(
        ClientConfig {
            reply_timeout_ms: Some(1_000),
            ..ClientConfig::default()
        },
        ServiceConfig {
            ring_length: 2,
            buffer_size: 4096,
            ..ServiceConfig::default()
        },
    );
    // No worker: the request sits in the ring unanswered.
    let mut request = cluster
        .client
        .create(OP_ECHO, &EchoBody::plain(vec![0; 8]), 128)
        .unwrap();
    cluster.client.dispatch(&mut request, &cluster.remote()).unwrap();
    let err = cluster
        .client
        .wait::<Vec<u8>>(&mut request, &CancelToken::never())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::RequestTimeout { timeout_ms: 1_000, .. }));
    assert_eq!(cluster.client_transport().metrics().snapshot().timeouts, 1);
    assert_eq!(cluster.net.stats().unlinks, 1);
}
