use std::convert::Infallible;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use hyper::header::{HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, AUTHORIZATION, CONTENT_TYPE, ORIGIN};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use hyper_tungstenite::tungstenite::Message;
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};

use crate::auth::{bearer_token, check_passcode, AttemptLimiter, SessionClaims, SessionSigner};
use crate::config::Config;
use crate::error::{AuthError, MessageError, ServerError};
use crate::hub::{spawn_hub, HubHandle};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::ConnId;

/// Shared across all requests.
pub struct AppContext {
    pub config: Config,
    pub hub: HubHandle,
    pub signer: SessionSigner,
    pub limiter: Mutex<AttemptLimiter>,
}

impl AppContext {
    /// Must be called inside a tokio runtime; spawns the hub task.
    pub fn new(config: Config) -> Arc<Self> {
        let hub = spawn_hub(config.unlock_reset_after);
        let signer = SessionSigner::new(&config.session_secret, config.session_ttl);
        Arc::new(Self {
            config,
            hub,
            signer,
            limiter: Mutex::new(AttemptLimiter::default()),
        })
    }
}

type SharedContext = Arc<AppContext>;

fn decode_path_segment(seg: &str) -> String {
    match urlencoding::decode(seg) {
        Ok(s) => s.into_owned(),
        Err(_) => seg.to_string(),
    }
}

fn query_param(req: &Request<Body>, name: &str) -> Option<String> {
    req.uri().query()?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| decode_path_segment(value))
    })
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    let mut resp = Response::new(Body::from(body.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

fn auth_status(err: &AuthError) -> StatusCode {
    match err {
        AuthError::PasscodeRequired => StatusCode::BAD_REQUEST,
        AuthError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        AuthError::NotConfigured | AuthError::Signing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        AuthError::InvalidPasscode | AuthError::MissingToken | AuthError::InvalidToken => {
            StatusCode::UNAUTHORIZED
        }
    }
}

fn with_cors(mut resp: Response<Body>, allow_origin: Option<&str>) -> Response<Body> {
    let headers = resp.headers_mut();
    if let Some(value) = allow_origin.and_then(|o| HeaderValue::from_str(o).ok()) {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
    headers.insert(
        "Access-Control-Allow-Methods",
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    resp
}

fn authorize(req: &Request<Body>, ctx: &AppContext) -> Result<SessionClaims, AuthError> {
    let header = req.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    let token = bearer_token(header).ok_or(AuthError::MissingToken)?;
    ctx.signer.verify(token, Utc::now())
}

// ============================================
// WebSocket Connection Handler
// ============================================

fn send_json(tx: &mpsc::UnboundedSender<Message>, msg: &ServerMessage) {
    if let Ok(json) = serde_json::to_string(msg) {
        let _ = tx.send(Message::Text(json));
    }
}

fn handle_frame(text: &str, conn_id: &ConnId, hub: &HubHandle) -> Result<(), MessageError> {
    let msg: ClientMessage = serde_json::from_str(text)?;
    hub.inbound(conn_id, msg)
}

async fn handle_connection(
    ws: hyper_tungstenite::WebSocketStream<hyper::upgrade::Upgraded>,
    addr: SocketAddr,
    hub: HubHandle,
) {
    let conn_id: ConnId = uuid::Uuid::new_v4().to_string();
    info!("WebSocket connection {} established from {}", conn_id, addr);

    let (mut ws_sender, mut ws_receiver) = ws.split();

    // Create channel for sending messages to this WebSocket
    let (tx, mut rx) = mpsc::unbounded_channel();

    // Spawn task to forward messages from channel to WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    if hub.connect(&conn_id, tx.clone()).is_err() {
        error!("Hub is gone, dropping connection {}", conn_id);
        send_task.abort();
        return;
    }

    // Handle incoming messages
    loop {
        tokio::select! {
            msg_result = ws_receiver.next() => {
                match msg_result {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = handle_frame(&text, &conn_id, &hub) {
                            warn!("Error handling message from {}: {}", conn_id, e);
                            send_json(&tx, &ServerMessage::Error { message: e.to_string() });
                            if matches!(e, MessageError::HubClosed) {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Client {} closed connection", addr);
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = tx.send(Message::Pong(data));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", addr, e);
                        break;
                    }
                    None => break,
                }
            }
            _ = &mut send_task => {
                break;
            }
        }
    }

    // Queued after every inbound message from this connection, so the hub
    // never sees an event from it after the disconnect.
    let _ = hub.disconnect(&conn_id);
    send_task.abort();
}

// ============================================
// HTTP REST API Handlers
// ============================================

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    #[serde(default)]
    passcode: Option<String>,
}

async fn verify_passcode(
    req: Request<Body>,
    addr: SocketAddr,
    ctx: &AppContext,
) -> Result<Response<Body>, hyper::Error> {
    if let Err(e) = ctx.limiter.lock().await.check(addr.ip(), Utc::now()) {
        warn!("Rate limited passcode attempt from {}", addr.ip());
        return Ok(json_response(auth_status(&e), json!({ "success": false, "message": e.to_string() })));
    }

    let body_bytes = hyper::body::to_bytes(req.into_body()).await?;
    let body = match serde_json::from_slice::<VerifyRequest>(&body_bytes) {
        Ok(body) => body,
        Err(e) => {
            warn!("Failed to parse verify request: {}", e);
            return Ok(json_response(
                StatusCode::BAD_REQUEST,
                json!({ "success": false, "message": format!("Invalid request body: {}", e) }),
            ));
        }
    };

    let issued = check_passcode(ctx.config.auth_passcode.as_deref(), body.passcode.as_deref())
        .and_then(|()| ctx.signer.issue(Utc::now()));

    match issued {
        Ok((claims, token)) => {
            info!("Session {} authenticated", claims.session_id);
            Ok(json_response(
                StatusCode::OK,
                json!({ "success": true, "token": token, "message": "Authenticated successfully" }),
            ))
        }
        Err(e) => {
            warn!("Passcode rejected: {}", e);
            Ok(json_response(auth_status(&e), json!({ "success": false, "message": e.to_string() })))
        }
    }
}

async fn handle_api_request(
    req: Request<Body>,
    addr: SocketAddr,
    ctx: SharedContext,
) -> Result<Response<Body>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    match (method, path.as_str()) {
        (Method::GET, "/api/health") => Ok(health()),
        (Method::POST, "/api/auth/verify") => verify_passcode(req, addr, &ctx).await,
        (Method::GET, "/api/auth/validate") => match authorize(&req, &ctx) {
            Ok(claims) => Ok(json_response(
                StatusCode::OK,
                json!({
                    "valid": true,
                    "session": {
                        "sessionId": claims.session_id,
                        "expiresAt": claims.expires(),
                    }
                }),
            )),
            Err(e) => Ok(json_response(auth_status(&e), json!({ "valid": false, "message": e.to_string() }))),
        },
        (Method::GET, "/api/sync-lock/status") => {
            if let Err(e) = authorize(&req, &ctx) {
                let resp = json_response(auth_status(&e), json!({ "success": false, "message": e.to_string() }));
                return Ok(resp);
            }
            match ctx.hub.status().await {
                Ok(status) => Ok(json_response(StatusCode::OK, json!(status))),
                Err(e) => {
                    error!("Status query failed: {}", e);
                    Ok(json_response(
                        StatusCode::SERVICE_UNAVAILABLE,
                        json!({ "success": false, "message": e.to_string() }),
                    ))
                }
            }
        }
        (_, "/api/health" | "/api/auth/verify" | "/api/auth/validate" | "/api/sync-lock/status") => {
            Ok(json_response(
                StatusCode::METHOD_NOT_ALLOWED,
                json!({ "success": false, "message": "Method not allowed" }),
            ))
        }
        _ => Ok(json_response(
            StatusCode::NOT_FOUND,
            json!({ "success": false, "message": "API endpoint not found" }),
        )),
    }
}

fn health() -> Response<Body> {
    json_response(
        StatusCode::OK,
        json!({ "status": "OK", "message": "HeartSync signaling server is running" }),
    )
}

// ============================================
// Main Request Handler
// ============================================

async fn handle_request(
    mut req: Request<Body>,
    addr: SocketAddr,
    ctx: SharedContext,
) -> Result<Response<Body>, hyper::Error> {
    let origin = req
        .headers()
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let allow_origin = ctx.config.cors_origin(origin.as_deref());

    // CORS preflight (needed for browser fetch from the web client)
    if req.method() == Method::OPTIONS {
        let mut resp = with_cors(Response::new(Body::empty()), allow_origin.as_deref());
        *resp.status_mut() = StatusCode::NO_CONTENT;
        resp.headers_mut()
            .insert("Access-Control-Max-Age", HeaderValue::from_static("86400"));
        return Ok(resp);
    }

    if req.uri().path() == "/health" {
        return Ok(with_cors(health(), allow_origin.as_deref()));
    }

    // WebSocket upgrade
    if hyper_tungstenite::is_upgrade_request(&req) {
        if ctx.config.socket_require_auth {
            let token = query_param(&req, "token");
            let verified = token
                .ok_or(AuthError::MissingToken)
                .and_then(|t| ctx.signer.verify(&t, Utc::now()));
            if let Err(e) = verified {
                warn!("Rejected WebSocket upgrade from {}: {}", addr, e);
                let resp = json_response(auth_status(&e), json!({ "success": false, "message": e.to_string() }));
                return Ok(with_cors(resp, allow_origin.as_deref()));
            }
        }

        match hyper_tungstenite::upgrade(&mut req, None) {
            Ok((response, websocket)) => {
                let hub = ctx.hub.clone();
                tokio::spawn(async move {
                    match websocket.await {
                        Ok(ws) => handle_connection(ws, addr, hub).await,
                        Err(e) => error!("WebSocket handshake with {} failed: {}", addr, e),
                    }
                });
                return Ok(response);
            }
            Err(e) => {
                error!("WebSocket upgrade error: {}", e);
                let resp = json_response(
                    StatusCode::BAD_REQUEST,
                    json!({ "success": false, "message": "Invalid WebSocket upgrade request" }),
                );
                return Ok(with_cors(resp, allow_origin.as_deref()));
            }
        }
    }

    if req.uri().path().starts_with("/api/") {
        let resp = handle_api_request(req, addr, ctx).await?;
        return Ok(with_cors(resp, allow_origin.as_deref()));
    }

    let resp = json_response(
        StatusCode::NOT_FOUND,
        json!({
            "success": false,
            "message": "Not found. Use /health for health check, /api/* for REST API, or upgrade to WebSocket."
        }),
    );
    Ok(with_cors(resp, allow_origin.as_deref()))
}

// ============================================
// Entry Point
// ============================================

/// Serves HTTP and WebSocket traffic on an already-bound listener until the
/// server fails.
pub async fn serve(listener: TcpListener, ctx: SharedContext) -> Result<(), ServerError> {
    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let addr = conn.remote_addr();
        let ctx = ctx.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle_request(req, addr, ctx.clone())))
        }
    });

    let server = Server::from_tcp(listener)?.serve(make_svc);
    info!("Signaling server listening on http://{}", server.local_addr());
    info!("WebSocket endpoint: ws://{}", server.local_addr());

    server.await?;
    Ok(())
}

/// Binds the configured address and serves until the server fails.
pub async fn run(config: Config) -> Result<(), ServerError> {
    let listener = TcpListener::bind(config.bind_addr)?;
    listener.set_nonblocking(true)?;
    let ctx = AppContext::new(config);
    serve(listener, ctx).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_param_decodes_values() {
        let req = Request::builder()
            .uri("/ws?room=x&token=v1.a%2Eb.c")
            .body(Body::empty())
            .unwrap();
        assert_eq!(query_param(&req, "token").as_deref(), Some("v1.a.b.c"));
        assert_eq!(query_param(&req, "missing"), None);
    }

    #[test]
    fn auth_errors_map_to_status_codes() {
        assert_eq!(auth_status(&AuthError::PasscodeRequired), StatusCode::BAD_REQUEST);
        assert_eq!(auth_status(&AuthError::InvalidPasscode), StatusCode::UNAUTHORIZED);
        assert_eq!(auth_status(&AuthError::RateLimited), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(auth_status(&AuthError::NotConfigured), StatusCode::INTERNAL_SERVER_ERROR);
    }

    fn client() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    fn allow_origin(resp: &Response<Body>) -> Option<&str> {
        resp.headers()
            .get(ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|v| v.to_str().ok())
    }

    #[tokio::test]
    async fn unknown_path_still_carries_cors_headers() {
        let ctx = AppContext::new(Config {
            allowed_origins: vec!["https://app.example".to_string()],
            ..Config::default()
        });
        let req = Request::builder()
            .uri("/nowhere")
            .header(ORIGIN, "https://app.example")
            .body(Body::empty())
            .unwrap();
        let resp = handle_request(req, client(), ctx).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(allow_origin(&resp), Some("https://app.example"));
    }

    #[tokio::test]
    async fn rejected_upgrade_still_carries_cors_headers() {
        let ctx = AppContext::new(Config {
            socket_require_auth: true,
            ..Config::default()
        });
        let req = Request::builder()
            .uri("/")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap();
        let resp = handle_request(req, client(), ctx).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(allow_origin(&resp), Some("*"));
    }
}
