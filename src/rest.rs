//! Shared HTTP listener serving every running namespace.
//!
//! Namespaces register under their base path. The listener is bound when the first namespace
//! registers and closed when the last one goes away, so a peer without namespaces refuses
//! connections. Requests are dispatched by longest matching base path.

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::{
    net::TcpSocket,
    sync::{Mutex, oneshot},
    task::JoinHandle,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{
    batch::{BatchError, BatchWriter},
    document::DocumentBuilder,
    opstore::{NAMESPACE_DELIMITER, OpStoreError, Operation, OperationStore, OperationType},
    protocol::ProtocolVersionSet,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    message: String,
    status: StatusCode,
}

impl ApiError {
    fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", StatusCode::NOT_FOUND, message)
    }

    pub fn gone(message: impl Into<String>) -> Self {
        Self::new("gone", StatusCode::GONE, message)
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new("payload_too_large", StatusCode::PAYLOAD_TOO_LARGE, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new("unavailable", StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal", StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code.to_string(),
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<BatchError> for ApiError {
    fn from(value: BatchError) -> Self {
        match value {
            BatchError::Invalid { .. } => ApiError::invalid_request(value.to_string()),
            BatchError::Busy | BatchError::Stopped => ApiError::unavailable(value.to_string()),
        }
    }
}

#[derive(Debug)]
pub enum RestError {
    BasePathConflict { base_path: String, namespace: String },
    Bind { addr: SocketAddr, reason: String },
}

impl std::fmt::Display for RestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BasePathConflict {
                base_path,
                namespace,
            } => write!(f, "base path {base_path} is already served by {namespace}"),
            Self::Bind { addr, reason } => write!(f, "bind {addr}: {reason}"),
        }
    }
}

impl std::error::Error for RestError {}

/// Request body accepted by `POST {base_path}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRequest {
    #[serde(rename = "type")]
    pub op_type: OperationType,
    #[serde(default)]
    pub did_suffix: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

/// Everything one namespace needs to answer requests.
pub struct NamespaceRoute {
    pub channel_id: String,
    pub namespace: String,
    pub base_path: String,
    pub opstore: Arc<OperationStore>,
    pub protocol: ProtocolVersionSet,
    pub writer: Arc<BatchWriter>,
    pub builder: Arc<dyn DocumentBuilder>,
    stopping: AtomicBool,
}

impl NamespaceRoute {
    pub fn new(
        channel_id: impl Into<String>,
        namespace: impl Into<String>,
        base_path: impl Into<String>,
        opstore: Arc<OperationStore>,
        protocol: ProtocolVersionSet,
        writer: Arc<BatchWriter>,
        builder: Arc<dyn DocumentBuilder>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            namespace: namespace.into(),
            base_path: base_path.into(),
            opstore,
            protocol,
            writer,
            builder,
            stopping: AtomicBool::new(false),
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn resolve(&self, id: &str) -> Result<Response, ApiError> {
        let prefix = format!("{}{NAMESPACE_DELIMITER}", self.namespace);
        let suffix = id
            .strip_prefix(prefix.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                ApiError::invalid_request(format!("document id must start with {prefix}"))
            })?;

        let operations = match self.opstore.get(suffix) {
            Ok(ops) => ops,
            Err(OpStoreError::NotFound { .. }) => {
                return Err(ApiError::not_found("document not found"));
            }
            Err(err) => {
                warn!(
                    namespace = %self.namespace,
                    %suffix,
                    error = %err,
                    "document resolution failed"
                );
                return Err(ApiError::internal(err.to_string()));
            }
        };
        let Some(resolved) = self.builder.build(&self.namespace, &operations) else {
            return Err(ApiError::not_found("document not found"));
        };
        if resolved.deactivated {
            return Err(ApiError::gone("document deactivated"));
        }
        Ok(Json(json!({
            "document": resolved.document,
            "deactivated": false,
        }))
        .into_response())
    }

    fn submit(&self, body: &[u8]) -> Result<Response, ApiError> {
        let params = self
            .protocol
            .current()
            .map_err(|e| ApiError::unavailable(e.to_string()))?;
        if body.len() as u64 > params.max_operation_byte_size {
            return Err(ApiError::payload_too_large(format!(
                "operation size {} exceeds maximum {}",
                body.len(),
                params.max_operation_byte_size
            )));
        }
        let req: OperationRequest = serde_json::from_slice(body)
            .map_err(|e| ApiError::invalid_request(e.to_string()))?;
        let op = Operation::new(req.op_type, req.did_suffix.unwrap_or_default(), req.payload);
        let id = self.writer.add(op)?;
        Ok((StatusCode::ACCEPTED, Json(json!({ "id": id }))).into_response())
    }
}

/// Handle returned by [`RestServer::register`].
pub struct RestEndpoint {
    server: RestServer,
    route: Arc<NamespaceRoute>,
}

impl RestEndpoint {
    pub fn base_path(&self) -> &str {
        &self.route.base_path
    }

    /// New requests are answered with 503 from now on.
    pub fn begin_stopping(&self) {
        self.route.stopping.store(true, Ordering::SeqCst);
    }

    pub async fn stop(&self) {
        self.begin_stopping();
        self.server.deregister(&self.route).await;
    }
}

struct Listener {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct Inner {
    listen: SocketAddr,
    routes: RwLock<BTreeMap<String, Arc<NamespaceRoute>>>,
    listener: Mutex<Option<Listener>>,
}

#[derive(Clone)]
pub struct RestServer {
    inner: Arc<Inner>,
}

impl RestServer {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            inner: Arc::new(Inner {
                listen,
                routes: RwLock::new(BTreeMap::new()),
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.inner.listen
    }

    /// Bound address while at least one namespace is registered.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.listener.lock().await.as_ref().map(|l| l.local_addr)
    }

    /// `(base_path, namespace)` of every registered route.
    pub fn routes(&self) -> Vec<(String, String)> {
        self.inner
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(base, route)| (base.clone(), route.namespace.clone()))
            .collect()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .fallback(dispatch)
            .with_state(self.inner.clone())
            .layer(TraceLayer::new_for_http())
    }

    pub async fn register(&self, route: NamespaceRoute) -> Result<RestEndpoint, RestError> {
        let route = Arc::new(route);
        let mut listener = self.inner.listener.lock().await;
        {
            let mut routes = self
                .inner
                .routes
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = routes.get(&route.base_path) {
                return Err(RestError::BasePathConflict {
                    base_path: route.base_path.clone(),
                    namespace: existing.namespace.clone(),
                });
            }
            routes.insert(route.base_path.clone(), route.clone());
        }

        if listener.is_none() {
            match self.start_listener().await {
                Ok(l) => *listener = Some(l),
                Err(err) => {
                    self.inner
                        .routes
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&route.base_path);
                    return Err(err);
                }
            }
        }

        info!(
            channel_id = %route.channel_id,
            namespace = %route.namespace,
            base_path = %route.base_path,
            "rest endpoint registered"
        );
        Ok(RestEndpoint {
            server: self.clone(),
            route,
        })
    }

    async fn deregister(&self, route: &Arc<NamespaceRoute>) {
        let mut listener = self.inner.listener.lock().await;
        let now_empty = {
            let mut routes = self
                .inner
                .routes
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if routes
                .get(&route.base_path)
                .is_some_and(|r| Arc::ptr_eq(r, route))
            {
                routes.remove(&route.base_path);
                info!(
                    channel_id = %route.channel_id,
                    namespace = %route.namespace,
                    base_path = %route.base_path,
                    "rest endpoint deregistered"
                );
            }
            routes.is_empty()
        };
        if now_empty && let Some(l) = listener.take() {
            stop_listener(l).await;
        }
    }

    /// Drops every route and closes the listener.
    pub async fn shutdown(&self) {
        let mut listener = self.inner.listener.lock().await;
        self.inner
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        if let Some(l) = listener.take() {
            stop_listener(l).await;
        }
    }

    async fn start_listener(&self) -> Result<Listener, RestError> {
        let addr = self.inner.listen;
        let bind_err = |e: std::io::Error| RestError::Bind {
            addr,
            reason: e.to_string(),
        };
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        let tcp = socket.listen(1024).map_err(bind_err)?;
        let local_addr = tcp.local_addr().map_err(bind_err)?;

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let app = self.router();
        let task = tokio::spawn(async move {
            let result = axum::serve(tcp, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(err) = result {
                warn!(%local_addr, error = %err, "rest listener failed");
            }
        });
        info!(%local_addr, "rest listener started");
        Ok(Listener {
            local_addr,
            shutdown,
            task,
        })
    }
}

async fn stop_listener(listener: Listener) {
    let Listener {
        local_addr,
        shutdown,
        mut task,
    } = listener;
    let _ = shutdown.send(());
    if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
        warn!(%local_addr, "rest listener did not drain in time; aborting");
        task.abort();
    }
    info!(%local_addr, "rest listener stopped");
}

fn page_not_found() -> Response {
    (StatusCode::NOT_FOUND, "404 page not found").into_response()
}

fn lookup(inner: &Inner, path: &str) -> Option<(Arc<NamespaceRoute>, String)> {
    let routes = inner.routes.read().unwrap_or_else(PoisonError::into_inner);
    routes
        .iter()
        .filter_map(|(base, route)| {
            let rest = path.strip_prefix(base.as_str())?;
            if rest.is_empty() || rest.starts_with('/') {
                Some((base.len(), route.clone(), rest.to_string()))
            } else {
                None
            }
        })
        .max_by_key(|(len, _, _)| *len)
        .map(|(_, route, rest)| (route, rest))
}

async fn dispatch(
    State(inner): State<Arc<Inner>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let Some((route, rest)) = lookup(&inner, uri.path()) else {
        return page_not_found();
    };
    if route.is_stopping() {
        return ApiError::unavailable("namespace is stopping").into_response();
    }
    debug!(namespace = %route.namespace, %method, path = %uri.path(), "dispatch");

    let result = if method == Method::POST && (rest.is_empty() || rest == "/") {
        route.submit(&body)
    } else if method == Method::GET
        && let Some(id) = rest.strip_prefix('/').filter(|id| !id.is_empty())
    {
        route.resolve(id)
    } else {
        return page_not_found();
    };
    result.unwrap_or_else(|err| err.into_response())
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt as _;
    use pretty_assertions::assert_eq;
    use tower::util::ServiceExt;

    use super::*;
    use crate::{
        batch::{BatchContext, BatchOptions, spawn_batch_writer},
        cas::MemCas,
        config_store::{
            ConfigFormat, ConfigKey, ConfigStore, ConfigValue, GLOBAL_MSP_ID,
            NAMESPACE_APP_VERSION, PROTOCOL_COMPONENT_NAME,
        },
        document::MergePatchBuilder,
        ledger::MemChannel,
    };

    const CC: &str = "configscc";

    fn local() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn route(channel: &Arc<MemChannel>, namespace: &str, base_path: &str) -> NamespaceRoute {
        let key = ConfigKey::component(
            GLOBAL_MSP_ID,
            namespace,
            NAMESPACE_APP_VERSION,
            PROTOCOL_COMPONENT_NAME,
            "0.5",
        );
        let params = json!({
            "startingBlockchainTime": 0,
            "hashAlgorithmInMultihashCode": 18,
            "maxOperationByteSize": 200,
            "maxOperationsPerBatch": 10,
        });
        channel.put_state(
            CC,
            &key.marshal(),
            ConfigValue::new("tx", ConfigFormat::Json, params.to_string())
                .to_bytes()
                .unwrap(),
        );
        let opstore = Arc::new(OperationStore::new("mychannel", namespace, channel.clone()));
        let protocol = ProtocolVersionSet::new(ConfigStore::new(channel.clone(), CC), namespace);
        let writer = Arc::new(spawn_batch_writer(
            BatchContext {
                channel_id: "mychannel".to_string(),
                namespace: namespace.to_string(),
                opstore: opstore.clone(),
                protocol: protocol.clone(),
                cas: Arc::new(MemCas::new()),
            },
            BatchOptions::default(),
        ));
        NamespaceRoute::new(
            "mychannel",
            namespace,
            base_path,
            opstore,
            protocol,
            writer,
            Arc::new(MergePatchBuilder),
        )
    }

    fn req(method: &str, uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_string(res: Response) -> String {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn body_json(res: Response) -> Value {
        serde_json::from_str(&body_string(res).await).unwrap()
    }

    #[tokio::test]
    async fn resolves_submitted_documents() {
        let channel = Arc::new(MemChannel::new("mychannel"));
        let server = RestServer::new(local());
        let endpoint = server
            .register(route(&channel, "did:sidetree", "/document"))
            .await
            .unwrap();
        let app = server.router();

        let res = app
            .clone()
            .oneshot(req(
                "POST",
                "/document",
                r#"{"type":"create","didSuffix":"abc","payload":{"document":{"k":1}}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(res).await, json!({"id": "did:sidetree:abc"}));

        endpoint.route.writer.flush().await.unwrap();

        let res = app
            .clone()
            .oneshot(req("GET", "/document/did:sidetree:abc", ""))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            body_json(res).await,
            json!({"document": {"k": 1}, "deactivated": false})
        );

        let res = app
            .clone()
            .oneshot(req("GET", "/document/did:sidetree:missing", ""))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_json(res).await,
            json!({"code": "not_found", "message": "document not found"})
        );

        let res = app
            .clone()
            .oneshot(req("GET", "/document/did:other:abc", ""))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        endpoint.route.writer.stop().await;
        endpoint.stop().await;
    }

    #[tokio::test]
    async fn deactivated_document_is_gone() {
        let channel = Arc::new(MemChannel::new("mychannel"));
        let server = RestServer::new(local());
        let endpoint = server
            .register(route(&channel, "did:sidetree", "/document"))
            .await
            .unwrap();
        let app = server.router();

        for body in [
            r#"{"type":"create","didSuffix":"abc","payload":{}}"#,
            r#"{"type":"deactivate","didSuffix":"abc"}"#,
        ] {
            let res = app.clone().oneshot(req("POST", "/document", body)).await.unwrap();
            assert_eq!(res.status(), StatusCode::ACCEPTED);
        }
        endpoint.route.writer.flush().await.unwrap();

        let res = app
            .oneshot(req("GET", "/document/did:sidetree:abc", ""))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::GONE);
        endpoint.stop().await;
    }

    #[tokio::test]
    async fn rejects_malformed_and_oversized_operations() {
        let channel = Arc::new(MemChannel::new("mychannel"));
        let server = RestServer::new(local());
        let endpoint = server
            .register(route(&channel, "did:sidetree", "/document"))
            .await
            .unwrap();
        let app = server.router();

        let res = app
            .clone()
            .oneshot(req("POST", "/document", r#"{"type":"explode"}"#))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = app
            .clone()
            .oneshot(req("POST", "/document", r#"{"type":"update","payload":{}}"#))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let big = format!(
            r#"{{"type":"create","payload":{{"pad":"{}"}}}}"#,
            "x".repeat(300)
        );
        let res = app.oneshot(req("POST", "/document", &big)).await.unwrap();
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
        endpoint.stop().await;
    }

    #[tokio::test]
    async fn unknown_paths_and_stopping_namespaces() {
        let channel = Arc::new(MemChannel::new("mychannel"));
        let server = RestServer::new(local());
        let endpoint = server
            .register(route(&channel, "did:sidetree", "/document"))
            .await
            .unwrap();
        let app = server.router();

        let res = app
            .clone()
            .oneshot(req("GET", "/documents/did:sidetree:abc", ""))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_string(res).await, "404 page not found");

        endpoint.begin_stopping();
        let res = app
            .clone()
            .oneshot(req("GET", "/document/did:sidetree:abc", ""))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

        endpoint.stop().await;
        let res = app
            .oneshot(req("GET", "/document/did:sidetree:abc", ""))
            .await
            .unwrap();
        assert_eq!(body_string(res).await, "404 page not found");
    }

    #[tokio::test]
    async fn listener_follows_registrations() {
        let channel = Arc::new(MemChannel::new("mychannel"));
        let server = RestServer::new(local());
        assert_eq!(server.local_addr().await, None);

        let a = server
            .register(route(&channel, "did:a", "/a"))
            .await
            .unwrap();
        let b = server
            .register(route(&channel, "did:b", "/b"))
            .await
            .unwrap();
        let addr = server.local_addr().await.unwrap();
        assert!(tokio::net::TcpStream::connect(addr).await.is_ok());

        let conflict = server.register(route(&channel, "did:c", "/a")).await;
        assert!(matches!(conflict, Err(RestError::BasePathConflict { .. })));

        a.stop().await;
        assert_eq!(server.routes(), vec![("/b".to_string(), "did:b".to_string())]);
        assert!(server.local_addr().await.is_some());

        b.stop().await;
        assert_eq!(server.local_addr().await, None);
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn longest_base_path_wins() {
        let channel = Arc::new(MemChannel::new("mychannel"));
        let server = RestServer::new(local());
        let outer = server
            .register(route(&channel, "did:outer", "/doc"))
            .await
            .unwrap();
        let inner = server
            .register(route(&channel, "did:inner", "/doc/inner"))
            .await
            .unwrap();
        let app = server.router();

        let res = app
            .clone()
            .oneshot(req("GET", "/doc/inner/did:inner:x", ""))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_json(res).await,
            json!({"code": "not_found", "message": "document not found"})
        );

        let res = app
            .oneshot(req("GET", "/doc/did:outer:x", ""))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        server.shutdown().await;
        drop((outer, inner));
        assert!(server.routes().is_empty());
    }
}
