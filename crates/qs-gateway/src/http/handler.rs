//! `GET`/`POST /:name`.
//!
//! Query routes answer from the observable table with an `ETag` set to the
//! value checksum. Functions, channel publishes and stream uploads are POSTs.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use qs_wire::{fingerprint, Payload};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::context::ServerContext;
use crate::domain::error::{SyncError, SyncResult};
use crate::domain::route::{RouteHandler, RouteKind, RouteSpec};
use crate::domain::session::{auth_from_headers, ClientId, HttpSession, Session};
use crate::http::encoding::{self, Encoding};
use crate::middleware::ip_protection::ClientIp;
use crate::middleware::metrics::RequestTimer;
use crate::middleware::rate_limit::rate_limit_response;
use crate::observable::table::GetOutcome;
use crate::ports::{StreamBody, StreamRequest};

/// Query parameter carrying the payload of a GET
const PAYLOAD_PARAM: &str = "payload";

/// Upload metadata headers handed to stream handlers, keyed by their JSON name
const FILE_HEADERS: [(&str, &str); 5] = [
    ("file-id", "fileId"),
    ("file-name", "fileName"),
    ("function-name", "functionName"),
    ("file-extension", "fileExtension"),
    ("file-size", "fileSize"),
];

/// Everything a request needs besides its body.
struct CallContext {
    ctx: Arc<ServerContext>,
    route: Arc<RouteSpec>,
    session: Session,
    params: HashMap<String, String>,
    headers: HeaderMap,
}

pub async fn http_call(
    State(ctx): State<Arc<ServerContext>>,
    ClientIp(ip): ClientIp,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let timer = RequestTimer::new(Arc::clone(&ctx.metrics));

    let route = match ctx.registry.resolve(&name).await {
        Ok(route) => route,
        Err(e) => {
            timer.finish(false);
            return error_response(&e, &Payload::Undefined);
        }
    };
    // the layer already charged one token
    if route.rate_limit_tokens > 1
        && !ctx
            .limiters
            .http
            .charge(ip, route.rate_limit_tokens - 1)
            .is_allowed()
    {
        timer.finish(false);
        return rate_limit_response(&ctx.limiters.http);
    }

    let session = Session::Http(HttpSession {
        client_id: ClientId::new(),
        ip,
        auth: auth_from_headers(&headers),
        headers: headers.clone(),
    });
    let call = CallContext {
        ctx,
        route,
        session,
        params,
        headers,
    };

    let response = match call.route.kind() {
        RouteKind::Stream if method == Method::POST => call.stream(body).await,
        RouteKind::Stream => Err((
            SyncError::CannotStreamToClient {
                name: call.route.name.clone(),
            },
            Payload::Undefined,
        )),
        kind => call.request(kind, &method, body).await,
    };
    match response {
        Ok(response) => {
            timer.finish(true);
            response
        }
        Err((e, payload)) => {
            timer.finish(false);
            debug!(route = %name, error = %e, "http request failed");
            error_response(&e, &payload)
        }
    }
}

type HandlerResult = Result<Response, (SyncError, Payload)>;

impl CallContext {
    fn limit(&self) -> usize {
        self.route
            .payload_limit(self.ctx.config.limits.max_payload_size)
    }

    async fn request(&self, kind: RouteKind, method: &Method, body: Body) -> HandlerResult {
        let payload = if method == Method::GET {
            self.query_payload(PAYLOAD_PARAM)
        } else {
            self.body_payload(body).await.map_err(|e| (e, Payload::Undefined))?
        };
        self.ctx
            .gate
            .check(&self.route, &self.session, &payload)
            .await
            .map_err(|e| (e, payload.clone()))?;

        match kind {
            RouteKind::Query => self.query(payload).await,
            RouteKind::Function => match self.ctx.runner.call(&self.route, payload.clone(), &self.session).await {
                Ok(out) => Ok(self.payload_response(StatusCode::OK, &out, None)),
                Err(e) => Err((e, payload)),
            },
            RouteKind::Channel => self.publish(payload).await,
            RouteKind::Stream => Err((
                SyncError::CannotStreamToClient {
                    name: self.route.name.clone(),
                },
                payload,
            )),
        }
    }

    /// Current value of the observable, or `304` when `If-None-Match` is it.
    async fn query(&self, payload: Payload) -> HandlerResult {
        let id = fingerprint(&self.route.name, &payload);
        let known = self
            .headers
            .get(header::IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_etag)
            .unwrap_or(0);
        match self
            .ctx
            .observables
            .get(id, &self.route, &payload, known)
            .await
        {
            Ok(GetOutcome::UpToDate { checksum }) => {
                self.ctx.metrics.record_not_modified();
                let mut response = StatusCode::NOT_MODIFIED.into_response();
                set_etag(&mut response, checksum);
                Ok(response)
            }
            Ok(GetOutcome::Value(value)) => {
                Ok(self.payload_response(StatusCode::OK, &value.payload, Some(value.checksum)))
            }
            Err(e) => Err((e, payload)),
        }
    }

    /// Channel payload from the query string, message from the body.
    async fn publish(&self, message: Payload) -> HandlerResult {
        let payload = self.query_payload(PAYLOAD_PARAM);
        let id = fingerprint(&self.route.name, &payload);
        let Some(target) = self.ctx.channels.publisher(id) else {
            // nobody listens
            return Ok(Json(json!({ "published": false })).into_response());
        };
        match &target.route.handler {
            RouteHandler::Channel(channel) => channel
                .publish(&target.payload, message, &target.emitter, &self.session)
                .await
                .map_err(|e| (e.into_sync(&self.route.name), payload.clone()))?,
            _ => {
                target.emitter.publish(message);
            }
        }
        Ok(Json(json!({ "published": true })).into_response())
    }

    async fn stream(&self, body: Body) -> HandlerResult {
        let name = self.route.name.clone();
        let Some(content_length) = self
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
        else {
            return Err((SyncError::LengthRequired { name }, Payload::Undefined));
        };
        let limit = self.limit();
        if content_length > limit as u64 {
            let error = SyncError::PayloadTooLarge {
                name,
                size: usize::try_from(content_length).unwrap_or(usize::MAX),
                limit,
            };
            return Err((error, Payload::Undefined));
        }

        let metadata = file_metadata(&self.headers);
        self.ctx
            .gate
            .check(&self.route, &self.session, &metadata)
            .await
            .map_err(|e| (e, metadata.clone()))?;

        let mut seen = 0u64;
        let chunks = body.into_data_stream().map(move |chunk| {
            let chunk = chunk.map_err(|e| SyncError::invalid_payload(&name, e.to_string()))?;
            seen += chunk.len() as u64;
            if seen > content_length {
                return Err(SyncError::invalid_payload(
                    &name,
                    "body is longer than Content-Length",
                ));
            }
            Ok(chunk)
        });
        let request = StreamRequest {
            metadata: metadata.clone(),
            content_size: Some(content_length),
            body: StreamBody::new(chunks),
        };
        match self.ctx.runner.call_stream(&self.route, request, &self.session).await {
            Ok(out) => Ok(self.payload_response(StatusCode::OK, &out, None)),
            Err(e) => Err((e, metadata)),
        }
    }

    fn query_payload(&self, key: &str) -> Payload {
        match self.params.get(key) {
            None => Payload::Undefined,
            Some(raw) => serde_json::from_str::<Value>(raw)
                .map(Payload::from)
                .unwrap_or_else(|_| Payload::String(raw.clone())),
        }
    }

    async fn body_payload(&self, body: Body) -> SyncResult<Payload> {
        let name = &self.route.name;
        let limit = self.limit();
        let coding = encoding::content_encoding(
            self.headers
                .get(header::CONTENT_ENCODING)
                .and_then(|v| v.to_str().ok()),
        )?;
        let raw = to_bytes(body, limit)
            .await
            .map_err(|_| SyncError::PayloadTooLarge {
                name: name.clone(),
                size: limit.saturating_add(1),
                limit,
            })?;
        let bytes = encoding::decode(coding, &raw, limit, name)?;
        let content_type = self
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        parse_body(content_type, bytes, name)
    }

    /// Serve `payload` with its MIME type, compressed when the client
    /// accepts it.
    fn payload_response(&self, status: StatusCode, payload: &Payload, etag: Option<u64>) -> Response {
        let accept = self
            .headers
            .get(header::ACCEPT_ENCODING)
            .and_then(|v| v.to_str().ok());
        let (body, used) = encoding::encode(encoding::negotiate(accept), payload.encode_bytes());
        let mut response = (status, body).into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(payload.content_type().mime()),
        );
        if let Some(coding) = used.header_value() {
            headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static(coding));
        }
        if used != Encoding::Identity || etag.is_some() {
            headers.insert(header::VARY, HeaderValue::from_static("accept-encoding"));
        }
        if let Some(checksum) = etag {
            set_etag(&mut response, checksum);
        }
        response
    }
}

/// Body bytes to a payload according to `Content-Type`.
fn parse_body(content_type: Option<&str>, bytes: Vec<u8>, name: &str) -> SyncResult<Payload> {
    if bytes.is_empty() {
        return Ok(Payload::Undefined);
    }
    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase());
    match mime.as_deref() {
        Some(m) if m == "application/json" || m.ends_with("+json") => {
            serde_json::from_slice::<Value>(&bytes)
                .map(Payload::from)
                .map_err(|e| SyncError::invalid_payload(name, format!("invalid JSON body: {e}")))
        }
        Some(m) if m.starts_with("text/") => String::from_utf8(bytes)
            .map(Payload::String)
            .map_err(|_| SyncError::invalid_payload(name, "body is not valid UTF-8")),
        Some(_) => Ok(Payload::Bytes(bytes.into())),
        None => Ok(serde_json::from_slice::<Value>(&bytes)
            .map(Payload::from)
            .unwrap_or_else(|_| Payload::Bytes(bytes.into()))),
    }
}

/// `File-*` headers as a JSON object.
fn file_metadata(headers: &HeaderMap) -> Payload {
    let mut meta = Map::new();
    for (header_name, key) in FILE_HEADERS {
        if let Some(value) = headers.get(header_name).and_then(|v| v.to_str().ok()) {
            meta.insert(key.to_string(), Value::String(value.to_string()));
        }
    }
    if meta.is_empty() {
        Payload::Undefined
    } else {
        Payload::Json(Value::Object(meta))
    }
}

/// Checksum from an `If-None-Match` value (`"123"`, `W/"123"` or `123`).
fn parse_etag(value: &str) -> Option<u64> {
    value.split(',').find_map(|tag| {
        let tag = tag.trim();
        let tag = tag.strip_prefix("W/").unwrap_or(tag);
        tag.trim_matches('"').parse().ok()
    })
}

fn set_etag(response: &mut Response, checksum: u64) {
    if let Ok(value) = HeaderValue::from_str(&format!("\"{checksum}\"")) {
        response.headers_mut().insert(header::ETAG, value);
    }
}

/// Structured error body with the taxonomy's status code.
pub fn error_response(error: &SyncError, payload: &Payload) -> Response {
    let body = error.report(None).with_payload(payload).to_json();
    (error.status(), Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::installer::StaticInstaller;
    use crate::domain::config::GatewayConfig;
    use crate::http::routes;
    use crate::observable::Update;
    use crate::ports::{AllowAll, FunctionError, FunctionHandler, StreamHandler};
    use crate::test_utils::{Echo, ManualQuery, TokenAuthorizer};
    use async_trait::async_trait;
    use axum::http::Request;
    use std::sync::atomic::Ordering;
    use tower::ServiceExt;

    struct CountBytes;

    #[async_trait]
    impl StreamHandler for CountBytes {
        async fn call(&self, mut request: StreamRequest, _: &Session) -> Result<Payload, FunctionError> {
            let mut total = 0;
            while let Some(chunk) = request.body.next().await {
                total += chunk.map_err(|e| FunctionError::new(e.to_string()))?.len();
            }
            Ok(Payload::Json(json!({ "bytes": total, "meta": request.metadata.to_json() })))
        }
    }

    struct Fails;

    #[async_trait]
    impl FunctionHandler for Fails {
        async fn call(&self, _: Payload, _: &Session) -> Result<Payload, FunctionError> {
            Err(FunctionError::new("boom"))
        }
    }

    fn context(installer: StaticInstaller) -> Arc<ServerContext> {
        ServerContext::new(GatewayConfig::default(), Arc::new(installer), Arc::new(AllowAll))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_function_post_echoes_json() {
        let ctx = context(StaticInstaller::new().with_route(RouteSpec::function("echo", Arc::new(Echo))));
        let response = routes(ctx)
            .oneshot(
                Request::post("/echo")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"a":1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let ctx = context(StaticInstaller::new());
        let response = routes(ctx)
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["type"], "FunctionNotFound");
    }

    #[tokio::test]
    async fn test_function_error_is_structured() {
        let ctx = context(StaticInstaller::new().with_route(RouteSpec::function("fails", Arc::new(Fails))));
        let response = routes(ctx)
            .oneshot(Request::post("/fails").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["type"], "FunctionError");
        assert_eq!(body["name"], "fails");
    }

    #[tokio::test]
    async fn test_query_etag_and_not_modified() {
        let (query, mut started) = ManualQuery::new();
        let ctx = context(StaticInstaller::new().with_route(RouteSpec::query("region", query)));
        tokio::spawn(async move {
            if let Some(emitter) = started.recv().await {
                emitter.update(Update::new(json!([{"id": 1}])).with_checksum(111));
                // keep the emitter alive
                std::future::pending::<()>().await;
            }
        });

        let app = routes(Arc::clone(&ctx));
        let response = app
            .clone()
            .oneshot(Request::get("/region").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::ETAG], "\"111\"");
        assert_eq!(body_json(response).await, json!([{"id": 1}]));

        let response = app
            .oneshot(
                Request::get("/region")
                    .header(header::IF_NONE_MATCH, "\"111\"")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(ctx.metrics.http_not_modified.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_stream_requires_content_length() {
        let ctx = context(StaticInstaller::new().with_route(RouteSpec::stream("upload", Arc::new(CountBytes))));
        let response = routes(ctx)
            .oneshot(
                Request::post("/upload")
                    .body(Body::from_stream(futures::stream::iter(vec![Ok::<_, std::io::Error>(
                        bytes::Bytes::from_static(b"abc"),
                    )])))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::LENGTH_REQUIRED);
    }

    #[tokio::test]
    async fn test_stream_reads_body_and_file_headers() {
        let ctx = context(StaticInstaller::new().with_route(RouteSpec::stream("upload", Arc::new(CountBytes))));
        let response = routes(ctx)
            .oneshot(
                Request::post("/upload")
                    .header(header::CONTENT_LENGTH, "5")
                    .header("File-Name", "a.txt")
                    .body(Body::from("hello"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({"bytes": 5, "meta": {"fileName": "a.txt"}})
        );
    }

    #[tokio::test]
    async fn test_rejected_authorization_is_403() {
        let installer = StaticInstaller::new().with_route(
            RouteSpec::function("echo", Arc::new(Echo)).with_authorizer(TokenAuthorizer::new("secret")),
        );
        let app = routes(context(installer));
        let response = app
            .clone()
            .oneshot(Request::post("/echo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .oneshot(
                Request::post("/echo")
                    .header(header::AUTHORIZATION, "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_parse_etag_forms() {
        assert_eq!(parse_etag("\"42\""), Some(42));
        assert_eq!(parse_etag("W/\"42\""), Some(42));
        assert_eq!(parse_etag("*"), None);
        assert_eq!(parse_etag("\"x\", \"7\""), Some(7));
    }

    #[test]
    fn test_body_by_content_type() {
        assert_eq!(
            parse_body(Some("text/plain; charset=utf-8"), b"hi".to_vec(), "f").unwrap(),
            Payload::String("hi".into())
        );
        assert_eq!(parse_body(None, b"[1]".to_vec(), "f").unwrap(), Payload::Json(json!([1])));
        assert_eq!(
            parse_body(Some("application/json"), b"{".to_vec(), "f").unwrap_err().kind(),
            "InvalidPayload"
        );
        assert_eq!(parse_body(None, Vec::new(), "f").unwrap(), Payload::Undefined);
    }
}
