//! HTTP + Server-Sent-Events transport.
//!
//! Requests, responses and notifications arrive over authenticated HTTP
//! POSTs; deliveries to the client flow over a per-connection SSE stream.
//! Login and refresh exchange credentials for tokens. Other wire protocols
//! plug in behind the same [`Transport`] interface.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{from_fn_with_state, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Extension, Json,
};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use authn_service::AuthInfo;
use hub_core::{Form, HubError, NotificationMessage, RequestMessage, ResponseMessage};

use crate::router::Router;
use crate::transport::manager::TransportManager;
use crate::transport::{Connection, SessionAuth, Subscriptions, Transport};

const CHANNEL_CAPACITY: usize = 64;

/// Header binding a POST to an established SSE connection.
const CONNECTION_ID_HEADER: &str = "x-connection-id";

pub struct HttpSseTransport {
    state: Arc<HttpState>,
    listen_addr: String,
    public_url: String,
    cancel: CancellationToken,
    server: Mutex<Option<JoinHandle<()>>>,
}

struct HttpState {
    router: Arc<Router>,
    manager: Arc<TransportManager>,
    auth: Arc<dyn SessionAuth>,
}

impl HttpSseTransport {
    pub fn new(
        router: Arc<Router>,
        manager: Arc<TransportManager>,
        auth: Arc<dyn SessionAuth>,
        listen_addr: &str,
        public_url: &str,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(HttpState {
                router,
                manager,
                auth,
            }),
            listen_addr: listen_addr.to_string(),
            public_url: public_url.trim_end_matches('/').to_string(),
            cancel: CancellationToken::new(),
            server: Mutex::new(None),
        })
    }

    fn build_app(&self) -> axum::Router {
        let state = Arc::clone(&self.state);
        let authed = axum::Router::new()
            .route("/hub/request", post(post_request))
            .route("/hub/response", post(post_response))
            .route("/hub/notification", post(post_notification))
            .route("/hub/sse", get(sse_stream))
            .layer(from_fn_with_state(Arc::clone(&state), auth_middleware));

        axum::Router::new()
            .route("/authn/login", post(login))
            .route("/authn/refresh", post(refresh))
            .route("/ping", get(|| async { "pong" }))
            .merge(authed)
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(state)
    }
}

#[async_trait]
impl Transport for HttpSseTransport {
    fn protocol(&self) -> &'static str {
        "https-sse"
    }

    async fn start(&self) -> Result<(), HubError> {
        let listener = tokio::net::TcpListener::bind(&self.listen_addr)
            .await
            .map_err(|e| {
                HubError::InternalError(format!("bind {}: {e}", self.listen_addr))
            })?;
        info!(addr = %self.listen_addr, "http transport listening");

        let app = self.build_app();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(error = %e, "http transport terminated");
            }
        });
        *self.server.lock().expect("server lock poisoned") = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.server.lock().expect("server lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn form_for(&self, operation: &str, dthing_id: &str, name: &str) -> Option<Form> {
        Some(Form::new(
            operation,
            format!(
                "{}/hub/request?op={operation}&thing={dthing_id}&name={name}",
                self.public_url
            ),
        ))
    }
}

/// Bearer-token authentication; the verified claims become the sender
/// identity for the whole request.
async fn auth_middleware(
    State(state): State<Arc<HttpState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, (StatusCode, Json<ErrorBody>)> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    let Some(token) = token else {
        return Err(unauthorized("missing bearer token"));
    };
    let auth = state
        .auth
        .authenticate_token("", token, None, None)
        .map_err(|e| unauthorized(&e.to_string()))?;

    request.extensions_mut().insert(auth);
    Ok(next.run(request).await)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn unauthorized(message: &str) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
}

fn error_status(err: &HubError) -> StatusCode {
    match err {
        HubError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        HubError::NotFound(_) => StatusCode::NOT_FOUND,
        HubError::AlreadyExists(_) => StatusCode::CONFLICT,
        HubError::InvalidCredentials(_)
        | HubError::InvalidToken(_)
        | HubError::TokenExpired(_)
        | HubError::TokenMismatch(_) => StatusCode::UNAUTHORIZED,
        HubError::Forbidden(_) => StatusCode::FORBIDDEN,
        HubError::AgentNotConnected(_) => StatusCode::SERVICE_UNAVAILABLE,
        HubError::DeliveryFailed(_) | HubError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        HubError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    client_id: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct TokenBody {
    token: String,
}

async fn login(
    State(state): State<Arc<HttpState>>,
    Json(body): Json<LoginBody>,
) -> Result<Json<TokenBody>, (StatusCode, Json<ErrorBody>)> {
    let token = state
        .auth
        .login_with_password(&body.client_id, &body.password)
        .map_err(|e| {
            (
                error_status(&e),
                Json(ErrorBody {
                    error: e.to_string(),
                }),
            )
        })?;
    Ok(Json(TokenBody { token }))
}

#[derive(Debug, Deserialize)]
struct RefreshBody {
    client_id: String,
    token: String,
}

async fn refresh(
    State(state): State<Arc<HttpState>>,
    Json(body): Json<RefreshBody>,
) -> Result<Json<TokenBody>, (StatusCode, Json<ErrorBody>)> {
    let token = state
        .auth
        .refresh_token(&body.client_id, &body.token)
        .map_err(|e| {
            (
                error_status(&e),
                Json(ErrorBody {
                    error: e.to_string(),
                }),
            )
        })?;
    Ok(Json(TokenBody { token }))
}

async fn post_request(
    State(state): State<Arc<HttpState>>,
    Extension(auth): Extension<AuthInfo>,
    headers: HeaderMap,
    Json(mut request): Json<RequestMessage>,
) -> Json<ResponseMessage> {
    request.sender_id = auth.client_id.clone();

    // a stated origin connection must belong to the authenticated client
    let origin = headers
        .get(CONNECTION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|id| {
            state
                .manager
                .get_connection(id)
                .map(|c| c.client_id() == auth.client_id)
                .unwrap_or(false)
        })
        .map(str::to_string);

    Json(state.router.handle_request(request, origin.as_deref()).await)
}

async fn post_response(
    State(state): State<Arc<HttpState>>,
    Extension(auth): Extension<AuthInfo>,
    Json(response): Json<ResponseMessage>,
) -> StatusCode {
    state.router.handle_response(response, &auth.client_id).await;
    StatusCode::NO_CONTENT
}

async fn post_notification(
    State(state): State<Arc<HttpState>>,
    Extension(auth): Extension<AuthInfo>,
    Json(notification): Json<NotificationMessage>,
) -> StatusCode {
    state
        .router
        .handle_notification(notification, &auth.client_id)
        .await;
    StatusCode::NO_CONTENT
}

struct HttpSseConnection {
    connection_id: String,
    client_id: String,
    tx: mpsc::Sender<Event>,
    subscriptions: Subscriptions,
    closed: AtomicBool,
}

impl HttpSseConnection {
    async fn deliver(&self, kind: &str, payload: impl Serialize) -> Result<(), HubError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HubError::DeliveryFailed(format!(
                "connection '{}' is closed",
                self.connection_id
            )));
        }
        let event = Event::default()
            .event(kind)
            .json_data(payload)
            .map_err(|e| HubError::InternalError(format!("encode sse event: {e}")))?;
        self.tx
            .send(event)
            .await
            .map_err(|_| HubError::DeliveryFailed(format!("client '{}' gone", self.client_id)))
    }
}

#[async_trait]
impl Connection for HttpSseConnection {
    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn protocol(&self) -> &'static str {
        "https-sse"
    }

    async fn send_request(&self, request: RequestMessage) -> Result<(), HubError> {
        self.deliver("request", request).await
    }

    async fn send_response(&self, response: ResponseMessage) -> Result<(), HubError> {
        self.deliver("response", response).await
    }

    async fn send_notification(
        &self,
        notification: NotificationMessage,
    ) -> Result<(), HubError> {
        self.deliver("notification", notification).await
    }

    fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Deregisters the connection when the client's SSE stream ends.
struct StreamGuard {
    manager: Arc<TransportManager>,
    connection_id: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.manager.remove_connection(&self.connection_id);
    }
}

async fn sse_stream(
    State(state): State<Arc<HttpState>>,
    Extension(auth): Extension<AuthInfo>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let connection = Arc::new(HttpSseConnection {
        connection_id: Uuid::new_v4().to_string(),
        client_id: auth.client_id.clone(),
        tx,
        subscriptions: Subscriptions::default(),
        closed: AtomicBool::new(false),
    });
    state.manager.add_connection(connection.clone());
    info!(client_id = %auth.client_id, connection_id = %connection.connection_id,
        "sse connection established");

    let hello = Event::default()
        .event("connected")
        .data(connection.connection_id.clone());
    let guard = StreamGuard {
        manager: Arc::clone(&state.manager),
        connection_id: connection.connection_id.clone(),
    };

    let deliveries = stream::unfold((rx, guard), |(mut rx, guard)| async move {
        rx.recv()
            .await
            .map(|event| (Ok::<Event, Infallible>(event), (rx, guard)))
    });
    let stream = stream::once(async move { Ok::<Event, Infallible>(hello) }).chain(deliveries);
    Sse::new(stream).keep_alive(KeepAlive::default())
}
