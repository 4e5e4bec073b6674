//! HTTP front-end.
//!
//! Routing is dynamic: a catch-all route resolves every request path against
//! the current snapshot, loaded exactly once per request. Per-prefix
//! endpoints: `GET {prefix}/sse`, `POST {prefix}/message?sessionId=`,
//! `POST {prefix}/mcp`, plus CORS preflight where the router configures it.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    Router,
    body::Bytes,
    extract::{Path, RawQuery, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{
        IntoResponse, Json, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::any,
};
use config::model::{AuthMode, CorsConfig};
use futures::Stream;
use mcp::protocol::{JsonRpcMessage, JsonRpcResponse, RpcError};
use shared::error::CommonError;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::dispatch::Dispatcher;
use crate::session::{SessionFrame, SessionInbound, SessionManager};
use crate::state::{RuntimeState, RuntimeUnit, StateRef};
use crate::template::RequestContext;

#[derive(Clone)]
pub struct GatewayService {
    pub state: StateRef,
    pub sessions: Arc<SessionManager>,
    pub dispatcher: Arc<Dispatcher>,
}

pub fn create_router(service: GatewayService) -> Router {
    Router::new()
        .route("/{*path}", any(handle_gateway))
        .with_state(service)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndpointKind {
    Sse,
    Message,
    Mcp,
}

fn join_prefix(prefix: &str, suffix: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.starts_with('/') {
        format!("{prefix}/{suffix}")
    } else {
        format!("/{prefix}/{suffix}")
    }
}

fn resolve(state: &RuntimeState, path: &str) -> Option<(Arc<RuntimeUnit>, EndpointKind)> {
    for (prefix, unit) in &state.units {
        let sse_base = unit.router.sse_prefix.as_deref().unwrap_or(prefix);
        if path == join_prefix(sse_base, "sse") {
            return Some((unit.clone(), EndpointKind::Sse));
        }
        if path == join_prefix(prefix, "message") {
            return Some((unit.clone(), EndpointKind::Message));
        }
        if path == join_prefix(prefix, "mcp") {
            return Some((unit.clone(), EndpointKind::Mcp));
        }
    }
    None
}

fn parse_query(raw: Option<&str>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let Some(raw) = raw else {
        return out;
    };
    for pair in raw.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = urlencoding::decode(key).map(|c| c.into_owned()).unwrap_or_else(|_| key.to_string());
        let value = urlencoding::decode(value)
            .map(|c| c.into_owned())
            .unwrap_or_else(|_| value.to_string());
        out.insert(key, value);
    }
    out
}

fn request_meta(headers: &HeaderMap, raw_query: Option<&str>) -> RequestContext {
    let mut meta = RequestContext {
        query: parse_query(raw_query),
        ..Default::default()
    };
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            meta.headers.insert(name.as_str().to_string(), value.to_string());
        }
    }
    if let Some(cookie_header) = headers.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
        for cookie in cookie_header.split(';') {
            if let Some((key, value)) = cookie.trim().split_once('=') {
                meta.cookies.insert(key.to_string(), value.to_string());
            }
        }
    }
    meta
}

fn check_auth(unit: &RuntimeUnit, headers: &HeaderMap) -> Result<(), CommonError> {
    let Some(auth) = &unit.router.auth else {
        return Ok(());
    };
    if auth.mode != AuthMode::Oauth2 {
        return Ok(());
    }
    let has_bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Bearer "));
    if has_bearer {
        Ok(())
    } else {
        Err(CommonError::Authentication {
            msg: "missing bearer token".to_string(),
            source: None,
        })
    }
}

fn allowed_origin<'a>(cors: &'a CorsConfig, origin: Option<&'a str>) -> Option<&'a str> {
    if cors.allow_origins.is_empty() || cors.allow_origins.iter().any(|o| o == "*") {
        return Some("*");
    }
    origin.filter(|o| cors.allow_origins.iter().any(|allowed| allowed == o))
}

fn apply_cors(response: &mut Response, unit: &RuntimeUnit, origin: Option<&str>) {
    let Some(cors) = &unit.router.cors else {
        return;
    };
    let Some(allow_origin) = allowed_origin(cors, origin) else {
        return;
    };

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(allow_origin) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
    headers.insert(header::VARY, HeaderValue::from_static("Origin"));
    if cors.allow_credentials {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
    }
    if !cors.expose_headers.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&cors.expose_headers.join(", ")) {
            headers.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, value);
        }
    }
}

fn preflight_response(unit: &RuntimeUnit, origin: Option<&str>) -> Response {
    let Some(cors) = &unit.router.cors else {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    };

    let mut response = StatusCode::NO_CONTENT.into_response();
    let methods = if cors.allow_methods.is_empty() {
        "GET, POST, OPTIONS".to_string()
    } else {
        cors.allow_methods.join(", ")
    };
    let allow_headers = if cors.allow_headers.is_empty() {
        "*".to_string()
    } else {
        cors.allow_headers.join(", ")
    };
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&methods) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, value);
    }
    if let Ok(value) = HeaderValue::from_str(&allow_headers) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, value);
    }
    apply_cors(&mut response, unit, origin);
    response
}

/// SSE stream that tears the session down when the client goes away.
struct SessionStream {
    inner: ReceiverStream<SessionFrame>,
    sessions: Arc<SessionManager>,
    session_id: String,
}

impl Stream for SessionStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx).map(|frame| {
            frame.map(|frame| Ok(Event::default().event(frame.event).data(frame.data)))
        })
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        self.sessions.close(&self.session_id);
    }
}

async fn handle_gateway(
    State(service): State<GatewayService>,
    Path(path): Path<String>,
    RawQuery(raw_query): RawQuery,
    method: axum::http::Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = if path.starts_with('/') {
        path
    } else {
        format!("/{path}")
    };

    // The snapshot pointer is loaded exactly once per request
    let state = service.state.load_full();
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());

    let Some((unit, kind)) = resolve(&state, &path) else {
        debug!(%path, "no prefix matches");
        return CommonError::not_found(format!("no route for {path}"), path).into_response();
    };

    if method == http::Method::OPTIONS {
        return preflight_response(&unit, origin);
    }

    if let Err(e) = check_auth(&unit, &headers) {
        let mut response = e.into_response();
        apply_cors(&mut response, &unit, origin);
        return response;
    }

    let mut response = match kind {
        EndpointKind::Sse if method == http::Method::GET => {
            open_sse(&service, state.clone(), unit.clone(), &headers, raw_query.as_deref()).await
        }
        EndpointKind::Message if method == http::Method::POST => {
            handle_message(&service, raw_query.as_deref(), body).await
        }
        EndpointKind::Mcp if method == http::Method::POST => {
            handle_streamable(&service, unit.clone(), &headers, raw_query.as_deref(), body).await
        }
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    };

    apply_cors(&mut response, &unit, origin);
    response
}

async fn open_sse(
    service: &GatewayService,
    state: Arc<RuntimeState>,
    unit: Arc<RuntimeUnit>,
    headers: &HeaderMap,
    raw_query: Option<&str>,
) -> Response {
    let meta = request_meta(headers, raw_query);
    let prefix = unit.router.prefix.clone();
    let (session, frame_rx) = service.sessions.open(&prefix, state, unit, meta).await;

    let stream = SessionStream {
        inner: ReceiverStream::new(frame_rx),
        sessions: service.sessions.clone(),
        session_id: session.id.clone(),
    };

    let mut response = Sse::new(stream).keep_alive(KeepAlive::default()).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

async fn handle_message(
    service: &GatewayService,
    raw_query: Option<&str>,
    body: Bytes,
) -> Response {
    let query = parse_query(raw_query);
    let Some(session_id) = query.get("sessionId") else {
        return CommonError::invalid_request("missing sessionId").into_response();
    };
    let Some(session) = service.sessions.get(session_id) else {
        return CommonError::not_found("unknown session", session_id.clone()).into_response();
    };

    let inbound = match serde_json::from_slice::<JsonRpcMessage>(&body) {
        Ok(JsonRpcMessage::Request(request)) => SessionInbound::Request(request),
        Ok(JsonRpcMessage::Notification(notification)) => {
            SessionInbound::Notification(notification)
        }
        Ok(JsonRpcMessage::Response(_)) => {
            // Client-side responses have no meaning here
            return StatusCode::ACCEPTED.into_response();
        }
        Err(e) => {
            return CommonError::InvalidRequest {
                msg: format!("invalid json-rpc frame: {e}"),
                source: Some(e.into()),
            }
            .into_response();
        }
    };

    match session.enqueue(inbound).await {
        // The response travels back on the SSE channel
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_streamable(
    service: &GatewayService,
    unit: Arc<RuntimeUnit>,
    headers: &HeaderMap,
    raw_query: Option<&str>,
    body: Bytes,
) -> Response {
    match serde_json::from_slice::<JsonRpcMessage>(&body) {
        Ok(JsonRpcMessage::Request(request)) => {
            let meta = request_meta(headers, raw_query);
            let response = service.dispatcher.dispatch_request(&unit, &meta, &request).await;
            Json(response).into_response()
        }
        Ok(_) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            let error = JsonRpcResponse::error(
                serde_json::Value::Null,
                RpcError::parse_error(e.to_string()),
            );
            (StatusCode::BAD_REQUEST, Json(error)).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::routing::get;
    use config::model::{
        ArgConfig, ArgPosition, AuthConfig, McpConfig, RouterConfig, ServerConfig, ToolConfig,
    };
    use http::Request;
    use mcp::protocol::methods;
    use tower::ServiceExt;

    use super::*;
    use crate::capability::CapabilityCache;
    use crate::state::{build_state, new_state_ref};

    async fn read_body(body: Body) -> Vec<u8> {
        use futures::StreamExt;
        let mut stream = body.into_data_stream();
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.expect("body read"));
        }
        out
    }

    fn service_with_state(state: crate::state::RuntimeState) -> GatewayService {
        let state_ref = new_state_ref();
        state_ref.store(Arc::new(state));
        let dispatcher = Arc::new(Dispatcher::new(
            Duration::from_secs(5),
            Arc::new(CapabilityCache::default()),
        ));
        GatewayService {
            state: state_ref,
            sessions: Arc::new(SessionManager::new(dispatcher.clone())),
            dispatcher,
        }
    }

    fn gateway_config(backend: &str) -> McpConfig {
        McpConfig {
            name: "gw".into(),
            routers: vec![RouterConfig {
                server: "s1".into(),
                prefix: "/h1".into(),
                ..Default::default()
            }],
            servers: vec![ServerConfig {
                name: "s1".into(),
                allowed_tools: vec!["echo".into()],
                ..Default::default()
            }],
            tools: vec![ToolConfig {
                name: "echo".into(),
                description: "echoes the message".into(),
                method: "GET".into(),
                endpoint: format!("{backend}/echo"),
                response_body: "echoed: {{ Response.Data.msg }}".into(),
                args: vec![ArgConfig {
                    name: "msg".into(),
                    position: ArgPosition::Query,
                    required: true,
                    type_: "string".into(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn rpc_body(id: i64, method: &str, params: serde_json::Value) -> Body {
        Body::from(
            serde_json::json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
                .to_string(),
        )
    }

    async fn post_mcp(app: &Router, body: Body) -> (StatusCode, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/h1/mcp")
                    .header("content-type", "application/json")
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = read_body(response.into_body()).await;
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn unknown_prefix_is_404() {
        let app = create_router(service_with_state(crate::state::RuntimeState::empty()));
        let response = app
            .oneshot(Request::builder().uri("/nope/sse").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn streamable_initialize_and_tools_list() {
        let state = build_state(&gateway_config("http://backend"), None, Duration::from_secs(5))
            .unwrap();
        let app = create_router(service_with_state(state));

        let (status, value) =
            post_mcp(&app, rpc_body(1, methods::INITIALIZE, serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["result"]["serverInfo"]["name"], "mcpd");

        let (status, value) =
            post_mcp(&app, rpc_body(2, methods::TOOLS_LIST, serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["result"]["tools"][0]["name"], "echo");
    }

    #[tokio::test]
    async fn http_tool_round_trip_through_stub_backend() {
        // Stub backend echoing the msg query parameter as JSON
        async fn echo(
            axum::extract::Query(q): axum::extract::Query<BTreeMap<String, String>>,
        ) -> Json<serde_json::Value> {
            Json(serde_json::json!({"msg": q.get("msg").cloned().unwrap_or_default()}))
        }
        let backend = Router::new().route("/echo", get(echo));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, backend).await.unwrap();
        });

        let config = gateway_config(&format!("http://{addr}"));
        let state = build_state(&config, None, Duration::from_secs(5)).unwrap();
        let app = create_router(service_with_state(state));

        let (status, value) = post_mcp(
            &app,
            rpc_body(
                1,
                methods::TOOLS_CALL,
                serde_json::json!({"name": "echo", "arguments": {"msg": "hi"}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let result = &value["result"];
        assert_eq!(result["content"][0]["type"], "text");
        assert_eq!(result["content"][0]["text"], "echoed: hi");
        assert!(result.get("isError").is_none());
    }

    #[tokio::test]
    async fn oauth_router_rejects_missing_bearer() {
        let mut config = gateway_config("http://backend");
        config.routers[0].auth = Some(AuthConfig {
            mode: AuthMode::Oauth2,
        });
        let state = build_state(&config, None, Duration::from_secs(5)).unwrap();
        let app = create_router(service_with_state(state));

        let (status, _) =
            post_mcp(&app, rpc_body(1, methods::INITIALIZE, serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/h1/mcp")
                    .header("authorization", "Bearer token-123")
                    .body(rpc_body(1, methods::INITIALIZE, serde_json::json!({})))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cors_preflight_when_configured() {
        let mut config = gateway_config("http://backend");
        config.routers[0].cors = Some(config::model::CorsConfig {
            allow_origins: vec!["https://app.example".into()],
            allow_methods: vec!["GET".into(), "POST".into()],
            ..Default::default()
        });
        let state = build_state(&config, None, Duration::from_secs(5)).unwrap();
        let app = create_router(service_with_state(state));

        let response = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/h1/mcp")
                    .header("origin", "https://app.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "https://app.example"
        );
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_METHODS)
                .unwrap(),
            "GET, POST"
        );
    }

    #[tokio::test]
    async fn sse_stream_advertises_the_message_endpoint() {
        let state = build_state(&gateway_config("http://backend"), None, Duration::from_secs(5))
            .unwrap();
        let app = create_router(service_with_state(state));

        let response = app
            .oneshot(Request::builder().uri("/h1/sse").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );
        assert_eq!(response.headers().get(header::CACHE_CONTROL).unwrap(), "no-cache");

        let mut stream = response.into_body().into_data_stream();
        use futures::StreamExt;
        let first = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("first frame timeout")
            .expect("stream ended")
            .unwrap();
        let text = String::from_utf8_lossy(&first);
        assert!(text.contains("event: endpoint"));
        assert!(text.contains("/h1/message?sessionId="));
    }

    #[tokio::test]
    async fn message_endpoint_requires_a_known_session() {
        let state = build_state(&gateway_config("http://backend"), None, Duration::from_secs(5))
            .unwrap();
        let app = create_router(service_with_state(state));

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/h1/message?sessionId=ghost")
                    .body(rpc_body(1, methods::PING, serde_json::json!({})))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/h1/message")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
