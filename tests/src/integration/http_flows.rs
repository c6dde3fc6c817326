//! # HTTP Flows
//!
//! The HTTP router shares tables with WebSocket clients: a GET reads the
//! same cached observable a socket subscribes to, and a POST to a channel
//! reaches the socket's subscribers.

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use axum::Router;
    use brotli::{CompressorWriter, Decompressor};
    use flate2::read::GzDecoder;
    use qs_gateway::domain::config::LimiterConfig;
    use qs_gateway::test_utils::{Echo, ManualChannel, ManualQuery};
    use qs_gateway::{AllowAll, GatewayConfig, RouteSpec, StaticInstaller, SyncGatewayService, Update};
    use qs_wire::frame::{encode_channel_subscribe, encode_subscribe};
    use qs_wire::{ChannelMode, OutgoingFrame, Payload};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::harness::TestClient;

    // URL-encoded {"region":"eu-west"}
    const REGION_PARAM: &str = "%7B%22region%22%3A%22eu-west%22%7D";

    fn service(config: GatewayConfig, routes: Vec<RouteSpec>) -> SyncGatewayService {
        let installer = StaticInstaller::new();
        for route in routes {
            installer.insert(route);
        }
        SyncGatewayService::new(config, Arc::new(installer), Arc::new(AllowAll)).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap()).unwrap()
    }

    async fn call(app: &Router, request: Request<Body>) -> axum::response::Response {
        app.clone().oneshot(request).await.unwrap()
    }

    #[tokio::test]
    async fn test_get_reads_value_shared_with_socket() {
        let (query, mut started) = ManualQuery::new();
        let service = service(GatewayConfig::default(), vec![RouteSpec::query("region", query)]);
        let ctx = service.context();
        let app = service.build_http_router();

        let client = TestClient::connect(&ctx);
        let payload = Payload::from(json!({"region": "eu-west"}));
        client.send(encode_subscribe(1, 0, "region", &payload).unwrap()).await;
        let emitter = started.recv().await.unwrap();
        emitter.update(Update::new(json!({"total": 3})).with_checksum(111));
        client.expect(1).await;

        let response = call(
            &app,
            Request::get(format!("/region?payload={REGION_PARAM}")).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::ETAG], "\"111\"");
        assert_eq!(json_body(response).await, json!({"total": 3}));

        let response = call(
            &app,
            Request::get(format!("/region?payload={REGION_PARAM}"))
                .header(header::IF_NONE_MATCH, "\"111\"")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);

        // no second query was started for the HTTP reader
        assert!(started.try_recv().is_err());
        assert_eq!(ctx.observables.len(), 1);
    }

    #[tokio::test]
    async fn test_post_to_channel_reaches_socket_subscriber() {
        let (channel, mut started) = ManualChannel::new();
        let service = service(GatewayConfig::default(), vec![RouteSpec::channel("chat", channel)]);
        let ctx = service.context();
        let app = service.build_http_router();

        let response = call(
            &app,
            Request::post("/chat")
                .header(header::CONTENT_TYPE, "text/plain")
                .body(Body::from("nobody"))
                .unwrap(),
        )
        .await;
        assert_eq!(json_body(response).await, json!({"published": false}));

        let client = TestClient::connect(&ctx);
        client
            .send(encode_channel_subscribe(4, ChannelMode::Subscribe, "chat", &Payload::Undefined).unwrap())
            .await;
        let _emitter = started.recv().await.unwrap();

        let response = call(
            &app,
            Request::post("/chat")
                .header(header::CONTENT_TYPE, "text/plain")
                .body(Body::from("hello"))
                .unwrap(),
        )
        .await;
        assert_eq!(json_body(response).await, json!({"published": true}));
        assert_eq!(
            client.expect(1).await,
            vec![OutgoingFrame::ChannelMessage { id: 4, payload: Payload::from("hello") }]
        );
    }

    #[tokio::test]
    async fn test_large_response_is_gzipped() {
        let service = service(GatewayConfig::default(), vec![RouteSpec::function("echo", Arc::new(Echo))]);
        let app = service.build_http_router();
        let rows: Vec<_> = (0..50).map(|i| json!({"id": i, "name": "same name"})).collect();
        let body = serde_json::to_vec(&rows).unwrap();

        let response = call(
            &app,
            Request::post("/echo")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::ACCEPT_ENCODING, "gzip")
                .body(Body::from(body.clone()))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_ENCODING], "gzip");

        let compressed = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let mut decoded = Vec::new();
        GzDecoder::new(&compressed[..]).read_to_end(&mut decoded).unwrap();
        assert_eq!(serde_json::from_slice::<Value>(&decoded).unwrap(), json!(rows));
    }

    #[tokio::test]
    async fn test_brotli_request_and_response() {
        let service = service(GatewayConfig::default(), vec![RouteSpec::function("echo", Arc::new(Echo))]);
        let app = service.build_http_router();
        let rows: Vec<_> = (0..50).map(|i| json!({"id": i, "name": "same name"})).collect();
        let mut encoder = CompressorWriter::new(Vec::new(), 4096, 5, 22);
        encoder.write_all(&serde_json::to_vec(&rows).unwrap()).unwrap();

        let response = call(
            &app,
            Request::post("/echo")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::CONTENT_ENCODING, "br")
                .header(header::ACCEPT_ENCODING, "br")
                .body(Body::from(encoder.into_inner()))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_ENCODING], "br");

        let compressed = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let mut decoded = Vec::new();
        Decompressor::new(&compressed[..], 4096).read_to_end(&mut decoded).unwrap();
        assert_eq!(serde_json::from_slice::<Value>(&decoded).unwrap(), json!(rows));
    }

    #[tokio::test]
    async fn test_http_rate_limit_returns_429() {
        let mut config = GatewayConfig::default();
        config.rate_limit.http = LimiterConfig::new(2, 1, Duration::from_secs(30));
        let service = service(config, vec![RouteSpec::function("echo", Arc::new(Echo))]);
        let app = service.build_http_router();

        let ok = call(&app, Request::post("/echo").body(Body::empty()).unwrap()).await;
        assert_eq!(ok.status(), StatusCode::OK);
        let limited = call(&app, Request::post("/echo").body(Body::empty()).unwrap()).await;
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(json_body(limited).await["type"], "RateLimit");
        assert!(service.metrics().to_prometheus().contains("sync_gateway_rate_limit_rejected_total 1"));
    }

    #[tokio::test]
    async fn test_cors_preflight() {
        let service = service(GatewayConfig::default(), vec![RouteSpec::function("echo", Arc::new(Echo))]);
        let app = service.build_http_router();
        let response = call(
            &app,
            Request::options("/echo")
                .header(header::ORIGIN, "https://app.example.com")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert!(response.status().is_success());
        assert!(response.headers().contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));
    }
}
