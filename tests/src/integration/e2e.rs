//! # End-to-End
//!
//! Full servers on loopback sockets, driven by a real WebSocket client.
//!
//! 1. **Demo routes**: subscribe to `counter`, call `increment`, see the update
//! 2. **Relay**: a channel on one server fed by the same channel on another

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};
    use qs_wire::frame::{encode_channel_publish, encode_channel_subscribe, encode_function_call, encode_subscribe};
    use qs_wire::{ChannelMode, OutgoingFrame, Payload};
    use serde_json::json;
    use sync_runtime::{RelayRoute, RuntimeConfig, SyncRuntime};
    use tokio::net::TcpListener;
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct Running {
        runtime: Arc<SyncRuntime>,
        addr: SocketAddr,
        task: JoinHandle<()>,
    }

    impl Running {
        async fn start(config: RuntimeConfig) -> Self {
            let runtime = Arc::new(SyncRuntime::new(config).unwrap());
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let task = {
                let runtime = Arc::clone(&runtime);
                tokio::spawn(async move {
                    runtime.run_on(Some(listener), None).await.unwrap();
                })
            };
            Self { runtime, addr, task }
        }

        fn url(&self) -> String {
            format!("ws://{}/", self.addr)
        }

        async fn connect(&self) -> Socket {
            connect_async(self.url()).await.unwrap().0
        }

        async fn stop(self) {
            self.runtime.shutdown();
            tokio::time::timeout(Duration::from_secs(10), self.task)
                .await
                .unwrap()
                .unwrap();
        }
    }

    async fn send(socket: &mut Socket, frame: Bytes) {
        socket.send(Message::Binary(frame)).await.unwrap();
    }

    /// Next decoded server frame, skipping non-binary messages.
    async fn next_frames(socket: &mut Socket) -> Vec<OutgoingFrame> {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket closed")
                .unwrap();
            if let Message::Binary(data) = message {
                return OutgoingFrame::decode_all(&data).unwrap();
            }
        }
    }

    async fn next_frame_matching(socket: &mut Socket, matches: impl Fn(&OutgoingFrame) -> bool) -> OutgoingFrame {
        loop {
            if let Some(frame) = next_frames(socket).await.into_iter().find(|f| matches(f)) {
                return frame;
            }
        }
    }

    fn demo_config() -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.gateway.admin.enabled = false;
        config
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_counter_subscription_sees_increment() {
        let server = Running::start(demo_config()).await;
        let mut socket = server.connect().await;

        send(&mut socket, encode_subscribe(1, 0, "counter", &Payload::Undefined).unwrap()).await;
        let first = next_frame_matching(&mut socket, |f| matches!(f, OutgoingFrame::SubscriptionData { id: 1, .. })).await;
        let OutgoingFrame::SubscriptionData { payload, .. } = first else {
            unreachable!()
        };
        assert_eq!(payload, Payload::from(json!({"value": 0})));

        send(&mut socket, encode_function_call(7, "increment", &Payload::from(json!({"by": 5}))).unwrap()).await;
        let response = next_frame_matching(&mut socket, |f| matches!(f, OutgoingFrame::FunctionResponse { .. })).await;
        assert_eq!(
            response,
            OutgoingFrame::FunctionResponse { req_id: 7, payload: Payload::from(json!({"value": 5})) }
        );
        let update = next_frame_matching(&mut socket, |f| matches!(f, OutgoingFrame::SubscriptionData { id: 1, .. })).await;
        assert!(matches!(
            update,
            OutgoingFrame::SubscriptionData { payload, .. } if payload == Payload::from(json!({"value": 5}))
        ));

        server.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_drains_connected_clients() {
        let server = Running::start(demo_config()).await;
        let mut socket = server.connect().await;
        // round trip so the connection is registered before draining
        send(&mut socket, encode_function_call(1, "echo", &Payload::from("ping")).unwrap()).await;
        next_frame_matching(&mut socket, |f| matches!(f, OutgoingFrame::FunctionResponse { .. })).await;

        server.runtime.shutdown();
        let drain = next_frame_matching(&mut socket, |f| matches!(f, OutgoingFrame::Drain { .. })).await;
        assert_eq!(drain, OutgoingFrame::Drain { reconnect_after_ms: 1000 });
        tokio::time::timeout(Duration::from_secs(10), server.task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_relay_forwards_upstream_channel() {
        let upstream = Running::start(demo_config()).await;

        let mut config = demo_config();
        config.demo_routes = false;
        config.relay.push(RelayRoute {
            name: "chat".into(),
            url: upstream.url(),
            token: None,
        });
        let edge = Running::start(config).await;

        let room = Payload::from(json!({"room": "lobby"}));
        let mut listener = edge.connect().await;
        send(
            &mut listener,
            encode_channel_subscribe(3, ChannelMode::Subscribe, "chat", &room).unwrap(),
        )
        .await;

        // wait for the edge's relay socket to join upstream
        let upstream_ctx = upstream.runtime.context();
        tokio::time::timeout(Duration::from_secs(5), async {
            while upstream_ctx.channels.subscriber_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("relay never subscribed upstream");

        let mut speaker = upstream.connect().await;
        send(
            &mut speaker,
            encode_channel_subscribe(1, ChannelMode::Subscribe, "chat", &room).unwrap(),
        )
        .await;
        send(&mut speaker, encode_channel_publish(1, &Payload::from("hello edge")).unwrap()).await;

        let message = next_frame_matching(&mut listener, |f| matches!(f, OutgoingFrame::ChannelMessage { .. })).await;
        assert_eq!(
            message,
            OutgoingFrame::ChannelMessage { id: 3, payload: Payload::from("hello edge") }
        );

        edge.stop().await;
        upstream.stop().await;
    }
}
