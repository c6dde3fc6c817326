//! # WebSocket Flows
//!
//! Client frames go through `WsConnection::handle_binary`, the same path the
//! socket reader uses. Server frames are read back from the connection's
//! outbound queue.
//!
//! ## Flows Tested:
//!
//! 1. **Observable lifecycle**: full frame, silent recompute, diff, late joiner
//! 2. **Idle countdown**: resubscribe reuses the query, sweep closes it
//!    (repeated subscribes are ignored, a second id for the same query is refused)
//! 3. **Auth retry**: rejected subscription joins after an auth frame
//! 4. **Functions, gets, channels, uploads**
//! 5. **Protection**: rate limit, subscription cap, malformed and text frames

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;
    use qs_gateway::domain::config::LimiterConfig;
    use qs_gateway::lifecycle::Sweep;
    use qs_gateway::ports::{FunctionError, StreamHandler, StreamRequest};
    use qs_gateway::test_utils::{Echo, ManualChannel, ManualQuery, TokenAuthorizer};
    use qs_gateway::ws::{CloseReason, Flow};
    use qs_gateway::{GatewayConfig, RouteSpec, Session, Update};
    use qs_wire::frame::{
        encode_auth, encode_channel_publish, encode_channel_subscribe, encode_function_call,
        encode_get, encode_stream_chunk, encode_stream_register, encode_subscribe,
        encode_unsubscribe,
    };
    use qs_wire::{ChannelMode, FrameHeader, OutgoingFrame, Payload, ReceiverCache};
    use serde_json::{json, Value};
    use tokio::time::Instant;

    use crate::harness::{error_type, server, server_with_authorizer, TestClient};

    // =========================================================================
    // FIXTURES
    // =========================================================================

    fn rows(n: u64) -> Value {
        Value::Array(
            (1..=n)
                .map(|i| json!({"id": i, "name": format!("row-{i}"), "region": "eu-west"}))
                .collect(),
        )
    }

    fn region() -> Payload {
        Payload::from(json!({"region": "eu-west"}))
    }

    /// Stream handler summing the upload size.
    struct CountBytes;

    #[async_trait]
    impl StreamHandler for CountBytes {
        async fn call(&self, mut request: StreamRequest, _session: &Session) -> Result<Payload, FunctionError> {
            let mut total = 0;
            while let Some(chunk) = request.body.next().await {
                total += chunk.map_err(|e| FunctionError::new(e.to_string()))?.len();
            }
            Ok(Payload::from(json!({"bytes": total, "metadata": request.metadata.to_json()})))
        }
    }

    // =========================================================================
    // OBSERVABLES
    // =========================================================================

    #[tokio::test]
    async fn test_subscription_full_then_silence_then_diff() {
        let (query, mut started) = ManualQuery::new();
        let ctx = server(GatewayConfig::default(), vec![RouteSpec::query("region", query)]);
        let client = TestClient::connect(&ctx);

        assert_eq!(client.send(encode_subscribe(5, 0, "region", &region()).unwrap()).await, Flow::Continue);
        let emitter = started.recv().await.unwrap();

        emitter.update(Update::new(rows(2)).with_checksum(111));
        emitter.update(Update::new(rows(2)).with_checksum(111));
        emitter.update(Update::new(rows(3)).with_checksum(222));

        let frames = client.expect(2).await;
        assert!(matches!(frames[0], OutgoingFrame::SubscriptionData { id: 5, checksum: 111, .. }));
        assert!(matches!(
            frames[1],
            OutgoingFrame::SubscriptionDiff { id: 5, checksum: 222, previous_checksum: 111, .. }
        ));
        client.expect_silence().await;

        // the diff applied to the held value reproduces the new value
        let mut cache = ReceiverCache::new();
        for frame in &frames {
            cache.apply(frame).unwrap();
        }
        let held = cache.get(5).unwrap();
        assert_eq!(held.checksum, 222);
        assert_eq!(held.payload, Payload::from(rows(3)));
    }

    #[tokio::test]
    async fn test_second_client_shares_query_with_own_id() {
        let (query, mut started) = ManualQuery::new();
        let ctx = server(GatewayConfig::default(), vec![RouteSpec::query("region", query)]);
        let first = TestClient::connect(&ctx);
        let second = TestClient::connect(&ctx);
        let current = TestClient::connect(&ctx);

        first.send(encode_subscribe(1, 0, "region", &region()).unwrap()).await;
        let emitter = started.recv().await.unwrap();
        emitter.update(Update::new(rows(3)).with_checksum(222));
        first.expect(1).await;

        second.send(encode_subscribe(42, 0, "region", &region()).unwrap()).await;
        match &second.expect(1).await[..] {
            [OutgoingFrame::SubscriptionData { id, checksum, payload }] => {
                assert_eq!((*id, *checksum), (42, 222));
                assert_eq!(payload, &Payload::from(rows(3)));
            }
            other => panic!("unexpected {other:?}"),
        }

        // already up to date: nothing to send
        current.send(encode_subscribe(7, 222, "region", &region()).unwrap()).await;
        current.expect_silence().await;

        // one query serves all three
        assert_eq!(ctx.observables.len(), 1);
        assert!(started.try_recv().is_err());
        assert_eq!(ctx.observables.subscriber_count(), 3);
    }

    #[tokio::test]
    async fn test_resubscribe_within_idle_window_reuses_query() {
        let (query, mut started) = ManualQuery::new();
        let route = RouteSpec::query("region", query.clone()).with_close_after_idle(Duration::from_secs(60));
        let ctx = server(GatewayConfig::default(), vec![route]);
        let client = TestClient::connect(&ctx);

        client.send(encode_subscribe(1, 0, "region", &region()).unwrap()).await;
        let emitter = started.recv().await.unwrap();
        emitter.update(Update::new(rows(2)).with_checksum(111));
        client.expect(1).await;

        client.send(encode_unsubscribe(1).unwrap()).await;
        assert_eq!(ctx.observables.subscriber_count(), 0);
        assert_eq!(ctx.observables.len(), 1);

        // comes back knowing the value: no frame, no restart
        client.send(encode_subscribe(1, 111, "region", &region()).unwrap()).await;
        client.expect_silence().await;
        assert!(started.try_recv().is_err());
        assert_eq!(query.closed(), 0);

        client.send(encode_unsubscribe(1).unwrap()).await;
        ctx.observables.sweep(Instant::now() + Duration::from_secs(61));
        assert!(ctx.observables.is_empty());
        // close handle is stored once the executor's start future resolves
        tokio::time::timeout(Duration::from_secs(5), async {
            while query.closed() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_query_error_reaches_subscriber() {
        let (query, mut started) = ManualQuery::new();
        let ctx = server(GatewayConfig::default(), vec![RouteSpec::query("region", query)]);
        let client = TestClient::connect(&ctx);

        client.send(encode_subscribe(3, 0, "region", &region()).unwrap()).await;
        let emitter = started.recv().await.unwrap();
        emitter.error(FunctionError::new("database offline"));

        let frames = client.expect(1).await;
        let OutgoingFrame::Error { error } = &frames[0] else {
            panic!("expected an error, got {frames:?}");
        };
        assert_eq!(error["type"], "FunctionError");
        assert_eq!(error["observableId"], "3");
        assert_eq!(error["payload"], json!({"region": "eu-west"}));

        // recovery sends a full frame
        emitter.update(rows(1));
        assert!(matches!(client.expect(1).await[0], OutgoingFrame::SubscriptionData { id: 3, .. }));
    }

    #[tokio::test]
    async fn test_get_waits_for_first_value_then_acks_current_checksum() {
        let (query, mut started) = ManualQuery::new();
        let ctx = server(GatewayConfig::default(), vec![RouteSpec::query("region", query)]);
        let client = TestClient::connect(&ctx);

        client.send(encode_get(9, 0, "region", &region()).unwrap()).await;
        let emitter = started.recv().await.unwrap();
        emitter.update(Update::new(rows(2)).with_checksum(111));
        assert!(matches!(
            client.expect(1).await[0],
            OutgoingFrame::SubscriptionData { id: 9, checksum: 111, .. }
        ));

        client.send(encode_get(9, 111, "region", &region()).unwrap()).await;
        assert_eq!(client.expect(1).await, vec![OutgoingFrame::GetUpToDate { id: 9 }]);
    }

    #[tokio::test]
    async fn test_repeated_subscribe_is_ignored() {
        let (query, mut started) = ManualQuery::new();
        let ctx = server(GatewayConfig::default(), vec![RouteSpec::query("region", query)]);
        let client = TestClient::connect(&ctx);

        let subscribe = encode_subscribe(5, 0, "region", &region()).unwrap();
        client.send(subscribe.clone()).await;
        let emitter = started.recv().await.unwrap();
        emitter.update(Update::new(rows(2)).with_checksum(111));
        client.expect(1).await;

        assert_eq!(client.send(subscribe).await, Flow::Continue);
        client.expect_silence().await;
        assert_eq!(ctx.observables.subscriber_count(), 1);
        assert_eq!(client.conn.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_second_id_for_same_query_is_rejected() {
        let (query, _started) = ManualQuery::new();
        let ctx = server(GatewayConfig::default(), vec![RouteSpec::query("region", query)]);
        let client = TestClient::connect(&ctx);

        client.send(encode_subscribe(1, 0, "region", &region()).unwrap()).await;
        client.send(encode_subscribe(2, 0, "region", &region()).unwrap()).await;
        let frames = client.expect(1).await;
        let OutgoingFrame::Error { error } = &frames[0] else {
            panic!("expected an error, got {frames:?}");
        };
        assert_eq!(error["type"], "InvalidPayload");
        assert_eq!(error["observableId"], "2");
        assert_eq!(client.conn.subscription_count(), 1);

        // the first id still owns the subscription
        client.send(encode_unsubscribe(1).unwrap()).await;
        assert_eq!(ctx.observables.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_get_on_subscribed_id_defers_to_subscription() {
        let (query, mut started) = ManualQuery::new();
        let ctx = server(GatewayConfig::default(), vec![RouteSpec::query("region", query)]);
        let client = TestClient::connect(&ctx);

        client.send(encode_subscribe(5, 0, "region", &region()).unwrap()).await;
        let emitter = started.recv().await.unwrap();
        emitter.update(Update::new(rows(2)).with_checksum(111));
        client.expect(1).await;

        client.send(encode_get(5, 0, "region", &region()).unwrap()).await;
        client.expect_silence().await;

        // updates keep flowing in order
        emitter.update(Update::new(rows(3)).with_checksum(222));
        assert!(matches!(
            client.expect(1).await[0],
            OutgoingFrame::SubscriptionDiff { id: 5, checksum: 222, previous_checksum: 111, .. }
        ));
    }

    #[tokio::test]
    async fn test_disconnect_releases_subscriptions() {
        let (query, _started) = ManualQuery::new();
        let ctx = server(GatewayConfig::default(), vec![RouteSpec::query("region", query)]);
        let client = TestClient::connect(&ctx);
        client.send(encode_subscribe(1, 0, "region", &region()).unwrap()).await;
        assert_eq!(ctx.connections.len(), 1);
        assert_eq!(ctx.observables.subscriber_count(), 1);

        drop(client);
        assert_eq!(ctx.connections.len(), 0);
        assert_eq!(ctx.observables.subscriber_count(), 0);
    }

    // =========================================================================
    // AUTHORIZATION
    // =========================================================================

    #[tokio::test]
    async fn test_rejected_subscription_joins_after_auth() {
        let (query, mut started) = ManualQuery::new();
        let ctx = server_with_authorizer(
            GatewayConfig::default(),
            vec![RouteSpec::query("region", query)],
            TokenAuthorizer::new("secret"),
        );
        let client = TestClient::connect(&ctx);

        client.send(encode_subscribe(5, 0, "region", &region()).unwrap()).await;
        let frames = client.expect(1).await;
        assert_eq!(error_type(&frames[0]), Some("AuthorizeRejectedError"));
        assert_eq!(ctx.observables.len(), 0);
        assert_eq!(client.conn.subscription_count(), 1);

        client.send(encode_auth(&Payload::from("wrong")).unwrap()).await;
        let frames = client.expect(2).await;
        assert!(matches!(frames[0], OutgoingFrame::Auth { .. }));
        assert_eq!(error_type(&frames[1]), Some("AuthorizeRejectedError"));

        client.send(encode_auth(&Payload::from("secret")).unwrap()).await;
        assert!(matches!(client.expect(1).await[0], OutgoingFrame::Auth { .. }));
        let emitter = started.recv().await.unwrap();
        emitter.update(rows(2));
        assert!(matches!(client.expect(1).await[0], OutgoingFrame::SubscriptionData { id: 5, .. }));
    }

    #[tokio::test]
    async fn test_public_route_skips_authorizer() {
        let ctx = server_with_authorizer(
            GatewayConfig::default(),
            vec![RouteSpec::function("echo", Arc::new(Echo)).public()],
            TokenAuthorizer::new("secret"),
        );
        let client = TestClient::connect(&ctx);
        client.send(encode_function_call(1, "echo", &Payload::from("hi")).unwrap()).await;
        assert_eq!(
            client.expect(1).await,
            vec![OutgoingFrame::FunctionResponse { req_id: 1, payload: Payload::from("hi") }]
        );
    }

    // =========================================================================
    // FUNCTIONS, CHANNELS, UPLOADS
    // =========================================================================

    #[tokio::test]
    async fn test_function_calls_and_unknown_route() {
        let ctx = server(GatewayConfig::default(), vec![RouteSpec::function("echo", Arc::new(Echo))]);
        let client = TestClient::connect(&ctx);

        let payload = Payload::from(json!({"n": 1}));
        client.send(encode_function_call(1, "echo", &payload).unwrap()).await;
        client.send(encode_function_call(2, "missing", &Payload::Undefined).unwrap()).await;

        let frames = client.expect(2).await;
        assert!(frames.contains(&OutgoingFrame::FunctionResponse { req_id: 1, payload }));
        let error = frames
            .iter()
            .find_map(|f| match f {
                OutgoingFrame::Error { error } => Some(error.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(error["type"], "FunctionNotFound");
        assert_eq!(error["requestId"], 2);
    }

    #[tokio::test]
    async fn test_wrong_route_kind_is_reported() {
        let ctx = server(GatewayConfig::default(), vec![RouteSpec::function("echo", Arc::new(Echo))]);
        let client = TestClient::connect(&ctx);
        client.send(encode_subscribe(1, 0, "echo", &Payload::Undefined).unwrap()).await;
        assert_eq!(error_type(&client.expect(1).await[0]), Some("FunctionIsWrongType"));
    }

    #[tokio::test]
    async fn test_channel_publish_fans_out_to_subscribers() {
        let (channel, mut started) = ManualChannel::new();
        let ctx = server(GatewayConfig::default(), vec![RouteSpec::channel("chat", channel)]);
        let alice = TestClient::connect(&ctx);
        let bob = TestClient::connect(&ctx);
        let room = Payload::from(json!({"room": 1}));

        alice
            .send(encode_channel_subscribe(10, ChannelMode::Subscribe, "chat", &room).unwrap())
            .await;
        bob.send(encode_channel_subscribe(20, ChannelMode::Subscribe, "chat", &room).unwrap())
            .await;
        let emitter = started.recv().await.unwrap();
        assert_eq!(ctx.channels.len(), 1);

        alice.send(encode_channel_publish(10, &Payload::from("hello")).unwrap()).await;
        let frames = bob.expect(1).await;
        assert_eq!(frames[0], OutgoingFrame::ChannelMessage { id: 20, payload: Payload::from("hello") });

        // server-side publishes reach both
        emitter.publish("from server");
        assert!(alice
            .expect(1)
            .await
            .iter()
            .any(|f| f == &OutgoingFrame::ChannelMessage { id: 10, payload: Payload::from("from server") }));
    }

    #[tokio::test]
    async fn test_publish_to_unjoined_channel_is_rejected() {
        let (channel, _started) = ManualChannel::new();
        let ctx = server(GatewayConfig::default(), vec![RouteSpec::channel("chat", channel)]);
        let client = TestClient::connect(&ctx);
        client.send(encode_channel_publish(99, &Payload::from("x")).unwrap()).await;
        let frames = client.expect(1).await;
        assert_eq!(error_type(&frames[0]), Some("InvalidPayload"));
    }

    #[tokio::test]
    async fn test_upload_is_acked_and_answered() {
        let ctx = server(GatewayConfig::default(), vec![RouteSpec::stream("upload", Arc::new(CountBytes))]);
        let client = TestClient::connect(&ctx);
        let metadata = Payload::from(json!({"fileName": "a.bin"}));

        client.send(encode_stream_register(3, 10, "upload", &metadata).unwrap()).await;
        client.send(encode_stream_chunk(3, 0, b"012345", false).unwrap()).await;
        client.send(encode_stream_chunk(3, 1, b"6789", false).unwrap()).await;

        let frames = client.expect(3).await;
        assert!(frames.contains(&OutgoingFrame::StreamChunkAck { req_id: 3, seq: 0 }));
        assert!(frames.contains(&OutgoingFrame::StreamChunkAck { req_id: 3, seq: 1 }));
        assert!(frames.contains(&OutgoingFrame::FunctionResponse {
            req_id: 3,
            payload: Payload::from(json!({"bytes": 10, "metadata": {"fileName": "a.bin"}})),
        }));
    }

    #[tokio::test]
    async fn test_chunk_past_declared_size_fails_upload() {
        let ctx = server(GatewayConfig::default(), vec![RouteSpec::stream("upload", Arc::new(CountBytes))]);
        let client = TestClient::connect(&ctx);

        client.send(encode_stream_register(4, 2, "upload", &Payload::Undefined).unwrap()).await;
        client.send(encode_stream_chunk(4, 0, b"too long", false).unwrap()).await;

        // the chunk is refused and the handler sees its body fail
        let frames = client.expect(2).await;
        let mut types: Vec<_> = frames.iter().filter_map(error_type).collect();
        types.sort_unstable();
        assert_eq!(types, vec!["FunctionError", "InvalidPayload"]);
    }

    // =========================================================================
    // PROTECTION
    // =========================================================================

    #[tokio::test]
    async fn test_rate_limit_sends_error_then_closes() {
        let mut config = GatewayConfig::default();
        config.rate_limit.ws = LimiterConfig::new(3, 1, Duration::from_secs(30));
        let ctx = server(config, vec![]);
        let client = TestClient::connect(&ctx);

        let auth = encode_auth(&Payload::from("t")).unwrap();
        assert_eq!(client.send(auth.clone()).await, Flow::Continue);
        assert_eq!(client.send(auth.clone()).await, Flow::Continue);
        assert_eq!(client.send(auth).await, Flow::Close);

        let frames = client.received();
        assert_eq!(error_type(frames.last().unwrap()), Some("RateLimit"));
        assert_eq!(client.conn.outbound().close_reason(), Some(CloseReason::Normal));
    }

    #[tokio::test]
    async fn test_subscription_cap_per_connection() {
        let (query, _started) = ManualQuery::new();
        let mut config = GatewayConfig::default();
        config.limits.max_subscriptions_per_connection = 1;
        let ctx = server(config, vec![RouteSpec::query("region", query)]);
        let client = TestClient::connect(&ctx);

        client.send(encode_subscribe(1, 0, "region", &region()).unwrap()).await;
        client.send(encode_subscribe(2, 0, "region", &Payload::from(json!({"region": "us"}))).unwrap()).await;
        let frames = client.expect(1).await;
        assert_eq!(error_type(&frames[0]), Some("InvalidPayload"));
        assert_eq!(client.conn.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_truncated_frame_aborts_connection() {
        let ctx = server(GatewayConfig::default(), vec![]);
        let client = TestClient::connect(&ctx);

        let mut data = FrameHeader::new(0, 64, false).unwrap().to_bytes().to_vec();
        data.extend_from_slice(b"xy");
        assert_eq!(client.send(Bytes::from(data)).await, Flow::Close);
        assert_eq!(client.conn.outbound().close_reason(), Some(CloseReason::Abort));
    }

    #[tokio::test]
    async fn test_text_frames_are_refused() {
        let ctx = server(GatewayConfig::default(), vec![]);
        let client = TestClient::connect(&ctx);
        assert_eq!(client.conn.handle_text(), Flow::Close);
        assert_eq!(error_type(&client.received()[0]), Some("NoBinaryProtocol"));
    }

    #[tokio::test]
    async fn test_drain_asks_clients_to_reconnect() {
        let ctx = server(GatewayConfig::default(), vec![]);
        let client = TestClient::connect(&ctx);
        assert_eq!(ctx.drain_connections(), 1);
        assert!(matches!(client.received()[..], [OutgoingFrame::Drain { reconnect_after_ms: 1000 }]));
        assert!(client.conn.outbound().is_closed());
    }
}
