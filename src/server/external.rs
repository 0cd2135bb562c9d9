//! HTTP API surface of a peer: JSON reads and writes, Server-Sent Event
//! streams, redirects of writes to the cluster leader, proxy mode, and the
//! shutdown/promote/demote lifecycle routes.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::model::{EventKinds, Instance, ServiceConfig, ServiceMeta};
use crate::server::{Membership, Store, Subscription};
use crate::utils::DiscoverdError;

use arc_swap::ArcSwap;

use bytes::Bytes;

use http::header::{self, HeaderName, HeaderValue};
use http::{Method, Request, Response, StatusCode};

use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, LengthLimitError, Limited, StreamBody};

use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;

use hyper_util::rt::TokioIo;

use rand::Rng;

use serde::{Deserialize, Serialize};

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

/// Response body type used by every handler.
pub type ApiBody = UnsyncBoxBody<Bytes, Infallible>;

/// Response header listing current raft peers.
pub const PEERS_HEADER: &str = "discoverd-peers";

/// Response header carrying the last applied log index.
pub const INDEX_HEADER: &str = "discoverd-index";

/// Largest request body accepted; anything bigger gets a 413.
pub const MAX_BODY_BYTES: usize = 1 << 20;

const EVENT_STREAM: &str = "text/event-stream";

/// SSE comment sent on idle streams.
const KEEPALIVE_FRAME: &str = ":\n\n";

/// Paths served by this peer itself even in proxy mode.
const LIFECYCLE_PATHS: [&str; 3] = ["/shutdown", "/raft/promote", "/raft/demote"];

/// Uniform JSON error envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub retry: bool,
}

impl From<&DiscoverdError> for ErrorEnvelope {
    fn from(e: &DiscoverdError) -> Self {
        ErrorEnvelope {
            code: e.code().into(),
            message: e.to_string(),
            retry: e.retry(),
        }
    }
}

/// Body of `GET /raft/leader`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftLeader {
    pub host: String,
}

/// Body of `POST /raft/nodes` and `POST /shutdown`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetLogIndex {
    pub last_index: u64,
}

/// Body of `GET /.well-known/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub data: StatusData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusData {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// What requests are served from.
pub enum Backend {
    /// A peer participating in consensus.
    Local(Arc<Store>),

    /// A non-member that redirects everything to a random peer.
    Proxy(Vec<String>),
}

fn full(bytes: impl Into<Bytes>) -> ApiBody {
    Full::new(bytes.into()).boxed_unsync()
}

fn empty() -> ApiBody {
    Empty::new().boxed_unsync()
}

fn set_header(resp: &mut Response<ApiBody>, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(v) => {
            resp.headers_mut().insert(name, v);
        }
        Err(e) => pf_warn!("invalid header value {:?}: {}", value, e),
    }
}

fn json_response<T: Serialize>(status: StatusCode, v: &T) -> Response<ApiBody> {
    match serde_json::to_vec(v) {
        Ok(buf) => {
            let mut resp = Response::new(full(buf));
            *resp.status_mut() = status;
            resp.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            resp
        }
        Err(e) => error_response(&DiscoverdError::from(e)),
    }
}

fn ok_empty() -> Response<ApiBody> {
    Response::new(empty())
}

fn error_response(e: &DiscoverdError) -> Response<ApiBody> {
    let status = StatusCode::from_u16(e.http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(status, &ErrorEnvelope::from(e))
}

/// 307 to the same path and query on `host`.
fn redirect_to_host(host: &str, parts: &http::request::Parts) -> Response<ApiBody> {
    let path = parts
        .uri
        .path_and_query()
        .map_or("/", |pq| pq.as_str());
    let location = if host.contains("://") {
        format!("{}{}", host.trim_end_matches('/'), path)
    } else {
        format!("http://{}{}", host, path)
    };
    let mut resp = Response::new(empty());
    *resp.status_mut() = StatusCode::TEMPORARY_REDIRECT;
    set_header(&mut resp, header::LOCATION, &location);
    resp
}

/// Wraps a subscription into an SSE body. A subscription cut off for being
/// too slow ends with an `error` event. After `keepalive` without events a
/// comment frame is written; a failed write ends the connection, which drops
/// the body and detaches the subscription.
fn sse_response(sub: Subscription, keepalive: Duration) -> Response<ApiBody> {
    let mut ticker = time::interval_at(Instant::now() + keepalive, keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let frames = futures::stream::unfold(Some((sub, ticker)), |state| async move {
        let (mut sub, mut ticker) = state?;
        let text = tokio::select! {
            biased;

            event = sub.recv() => match event {
                Some(event) => {
                    ticker.reset();
                    match serde_json::to_string(&event) {
                        Ok(json) => format!("data: {}\n\n", json),
                        Err(e) => format!("event: error\ndata: {}\n\n", e),
                    }
                }
                None => {
                    let err = sub.err()?;
                    let text = format!("event: error\ndata: {}\n\n", err);
                    let frame: Result<Frame<Bytes>, Infallible> =
                        Ok(Frame::data(Bytes::from(text)));
                    return Some((frame, None));
                }
            },

            _ = ticker.tick() => KEEPALIVE_FRAME.to_string(),
        };
        let frame: Result<Frame<Bytes>, Infallible> =
            Ok(Frame::data(Bytes::from(text)));
        Some((frame, Some((sub, ticker))))
    });

    let mut resp = Response::new(StreamBody::new(frames).boxed_unsync());
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(EVENT_STREAM),
    );
    resp.headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    resp
}

fn wants_stream(parts: &http::request::Parts) -> bool {
    parts
        .headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains(EVENT_STREAM))
}

/// Finds a query parameter, percent-decoded.
fn query_param(parts: &http::request::Parts, key: &str) -> Option<String> {
    let query = parts.uri.query()?;
    form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

fn is_lifecycle(parts: &http::request::Parts) -> bool {
    parts.method == Method::POST
        && LIFECYCLE_PATHS.contains(&parts.uri.path().trim_end_matches('/'))
}

/// Reads a whole request body of at most `limit` bytes.
async fn read_body(body: Incoming, limit: usize) -> Result<Bytes, DiscoverdError> {
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            Err(DiscoverdError::PayloadTooLarge(format!(
                "discoverd: request body over {} bytes",
                limit
            )))
        }
        Err(e) => Err(DiscoverdError::msg(e)),
    }
}

fn decode_body<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, DiscoverdError> {
    serde_json::from_slice(body).map_err(|e| {
        DiscoverdError::Validation(format!("discoverd: invalid request body: {}", e))
    })
}

/// Request handler shared by all connections.
pub struct HttpHandler {
    /// Current backend; swappable at runtime (e.g. proxy to member).
    backend: ArcSwap<Backend>,

    /// Set once `/shutdown` was served; everything gets a 503 afterwards.
    shutdown: AtomicBool,

    /// Role lifecycle behind the shutdown/promote/demote routes.
    membership: OnceLock<Arc<Membership>>,

    /// Request body size limit.
    body_limit: usize,
}

impl HttpHandler {
    /// Creates a handler over the given backend.
    pub fn new(backend: Backend) -> Arc<Self> {
        Self::with_body_limit(backend, MAX_BODY_BYTES)
    }

    /// Creates a handler rejecting request bodies over `body_limit` bytes.
    pub fn with_body_limit(backend: Backend, body_limit: usize) -> Arc<Self> {
        Arc::new(HttpHandler {
            backend: ArcSwap::from_pointee(backend),
            shutdown: AtomicBool::new(false),
            membership: OnceLock::new(),
            body_limit,
        })
    }

    /// Replaces the backend for subsequent requests.
    pub fn set_backend(&self, backend: Backend) {
        self.backend.store(Arc::new(backend));
    }

    /// Hooks up the lifecycle routes. Can be done once.
    pub fn set_membership(&self, membership: Arc<Membership>) -> Result<(), DiscoverdError> {
        self.membership
            .set(membership)
            .map_err(|_| DiscoverdError::msg("membership already set"))
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Serves one request. Never fails; errors become JSON envelopes.
    pub async fn handle(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Result<Response<ApiBody>, Infallible> {
        if self.is_shutdown() {
            return Ok(error_response(&DiscoverdError::Shutdown));
        }

        let (parts, body) = req.into_parts();
        let body = match read_body(body, self.body_limit).await {
            Ok(body) => body,
            Err(e) => {
                pf_info!("{} {}: {}", parts.method, parts.uri.path(), e);
                return Ok(error_response(&e));
            }
        };

        if is_lifecycle(&parts) {
            return Ok(self.serve_lifecycle(&parts).await);
        }

        let backend = self.backend.load_full();
        let resp = match backend.as_ref() {
            Backend::Proxy(peers) => {
                if peers.is_empty() {
                    error_response(&DiscoverdError::NoKnownLeader)
                } else {
                    let host = &peers[rand::thread_rng().gen_range(0..peers.len())];
                    redirect_to_host(host, &parts)
                }
            }
            Backend::Local(store) => {
                let mut resp = Self::dispatch(store, &parts, &body).await;
                set_header(
                    &mut resp,
                    HeaderName::from_static(PEERS_HEADER),
                    &store.peers().join(","),
                );
                set_header(
                    &mut resp,
                    HeaderName::from_static(INDEX_HEADER),
                    &store.last_index().to_string(),
                );
                resp
            }
        };

        let status = resp.status();
        if !status.is_success() && status != StatusCode::TEMPORARY_REDIRECT {
            pf_info!("{} {} -> {}", parts.method, parts.uri.path(), status.as_u16());
        }
        Ok(resp)
    }

    /// Serves `/shutdown`, `/raft/promote` and `/raft/demote` locally.
    async fn serve_lifecycle(&self, parts: &http::request::Parts) -> Response<ApiBody> {
        let Some(membership) = self.membership.get() else {
            return error_response(&DiscoverdError::msg(
                "discoverd: peer lifecycle is not managed here",
            ));
        };

        let result = match parts.uri.path().trim_end_matches('/') {
            "/shutdown" => {
                self.shutdown.store(true, Ordering::Release);
                pf_warn!("shutting down on request");
                membership
                    .shutdown()
                    .await
                    .map(|last_index| Some(TargetLogIndex { last_index }))
            }
            "/raft/promote" => membership.promote(self).await.map(|_| None),
            _ => membership.demote(self).await.map(|_| None),
        };
        match result {
            Ok(Some(target)) => json_response(StatusCode::OK, &target),
            Ok(None) => ok_empty(),
            Err(e) => error_response(&e),
        }
    }

    /// Maps a write outcome to a response: `NotLeader` becomes a redirect
    /// to the current leader, or 503 if there is none.
    fn write_result<T: Serialize>(
        store: &Store,
        parts: &http::request::Parts,
        result: Result<Option<T>, DiscoverdError>,
    ) -> Response<ApiBody> {
        match result {
            Ok(Some(v)) => json_response(StatusCode::OK, &v),
            Ok(None) => ok_empty(),
            Err(DiscoverdError::NotLeader) => match store.leader() {
                Some(leader) => redirect_to_host(&leader, parts),
                None => error_response(&DiscoverdError::NoKnownLeader),
            },
            Err(e) => error_response(&e),
        }
    }

    async fn dispatch(
        store: &Store,
        parts: &http::request::Parts,
        body: &[u8],
    ) -> Response<ApiBody> {
        let segments: Vec<&str> = parts
            .uri
            .path()
            .trim_matches('/')
            .split('/')
            .collect();

        match (&parts.method, segments.as_slice()) {
            (&Method::GET, ["ping"]) => ok_empty(),

            (&Method::GET, [".well-known", "status"]) => {
                let data = match store.leader() {
                    Some(_) => StatusData {
                        status: "healthy".into(),
                        detail: None,
                    },
                    None => StatusData {
                        status: "unhealthy".into(),
                        detail: Some(DiscoverdError::NoKnownLeader.to_string()),
                    },
                };
                json_response(StatusCode::OK, &StatusReport { data })
            }

            (&Method::GET, ["raft", "leader"]) => match store.leader() {
                Some(host) => json_response(StatusCode::OK, &RaftLeader { host }),
                None => error_response(&DiscoverdError::NoKnownLeader),
            },

            (&Method::GET, ["raft", "peers"]) => {
                json_response(StatusCode::OK, &store.peers())
            }

            (&Method::POST, ["raft", "nodes"]) | (&Method::DELETE, ["raft", "nodes"]) => {
                let Some(addr) = query_param(parts, "addr") else {
                    return error_response(&DiscoverdError::Validation(
                        "discoverd: addr query parameter required".into(),
                    ));
                };
                let result = if parts.method == Method::POST {
                    store.add_peer(&addr).await.map(|_| {
                        Some(TargetLogIndex {
                            last_index: store.last_index(),
                        })
                    })
                } else {
                    store.remove_peer(&addr).await.map(|_| None)
                };
                Self::write_result(store, parts, result)
            }

            (&Method::PUT, ["services", service]) => {
                let result = match decode_body::<ServiceConfig>(body) {
                    Ok(config) => store.add_service(service, config).await,
                    Err(e) => Err(e),
                };
                Self::write_result::<()>(store, parts, result.map(|_| None))
            }

            (&Method::DELETE, ["services", service]) => {
                let result = store.remove_service(service).await;
                Self::write_result::<()>(store, parts, result.map(|_| None))
            }

            (&Method::GET, ["services", service]) => {
                Self::stream(store, service, EventKinds::all())
            }

            (&Method::PUT, ["services", service, "meta"]) => {
                let result = match decode_body::<ServiceMeta>(body) {
                    Ok(meta) => store.set_service_meta(service, meta).await,
                    Err(e) => Err(e),
                };
                Self::write_result(store, parts, result.map(Some))
            }

            (&Method::GET, ["services", service, "meta"]) => {
                match store.service_meta(service) {
                    Some(meta) => json_response(StatusCode::OK, &meta),
                    None => error_response(&DiscoverdError::ObjectNotFound(
                        "service meta not found".into(),
                    )),
                }
            }

            (&Method::GET, ["services", service, "instances"]) => {
                if wants_stream(parts) {
                    return Self::stream(store, service, EventKinds::INSTANCES);
                }
                match store.instances(service) {
                    Ok(list) => json_response(StatusCode::OK, &list),
                    Err(e) => error_response(&e),
                }
            }

            (&Method::PUT, ["services", service, "instances", id]) => {
                let result = match decode_body::<Instance>(body) {
                    Ok(inst) if inst.id != *id => Err(DiscoverdError::Validation(
                        format!("discoverd: instance id {:?} does not match path", inst.id),
                    )),
                    Ok(inst) => store.add_instance(service, &inst).await,
                    Err(e) => Err(e),
                };
                Self::write_result::<()>(store, parts, result.map(|_| None))
            }

            (&Method::DELETE, ["services", service, "instances", id]) => {
                let result = store.remove_instance(service, id).await;
                Self::write_result::<()>(store, parts, result.map(|_| None))
            }

            (&Method::PUT, ["services", service, "leader"]) => {
                let manual = store
                    .config(service)
                    .is_some_and(|c| c == ServiceConfig::manual());
                if !manual {
                    return error_response(&DiscoverdError::Validation(
                        "service leader election type is not manual".into(),
                    ));
                }
                let result = match decode_body::<Instance>(body) {
                    Ok(inst) => store.set_service_leader(service, &inst.id).await,
                    Err(e) => Err(e),
                };
                Self::write_result::<()>(store, parts, result.map(|_| None))
            }

            (&Method::GET, ["services", service, "leader"]) => {
                if wants_stream(parts) {
                    return Self::stream(store, service, EventKinds::LEADER);
                }
                match store.service_leader(service) {
                    Some(leader) => json_response(StatusCode::OK, &leader),
                    None => error_response(&DiscoverdError::ObjectNotFound(
                        "no leader found".into(),
                    )),
                }
            }

            _ => error_response(&DiscoverdError::ObjectNotFound(format!(
                "discoverd: no route for {} {}",
                parts.method,
                parts.uri.path()
            ))),
        }
    }

    fn stream(store: &Store, service: &str, kinds: EventKinds) -> Response<ApiBody> {
        match store.subscribe(service, true, kinds) {
            Ok(sub) => sse_response(sub, store.config_ref().stream_keepalive()),
            Err(e) => error_response(&e),
        }
    }
}

/// HTTP listener of a peer. Each connection is served by its own task.
pub struct ExternalApi {
    /// Address actually bound.
    local_addr: SocketAddr,

    /// Sender side of the termination channel.
    tx_term: watch::Sender<bool>,

    /// Join handle of the connection acceptor task.
    acceptor_handle: Option<JoinHandle<()>>,
}

// ExternalApi public API implementation
impl ExternalApi {
    /// Binds to `bind_addr` and spawns the acceptor task.
    pub async fn setup(
        bind_addr: SocketAddr,
        handler: Arc<HttpHandler>,
    ) -> Result<Self, DiscoverdError> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx_term, rx_term) = watch::channel(false);

        let acceptor_handle =
            tokio::spawn(Self::acceptor_task(listener, handler, rx_term));
        pf_info!("http api listening on {}", local_addr);

        Ok(ExternalApi {
            local_addr,
            tx_term,
            acceptor_handle: Some(acceptor_handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and tears down open connections.
    pub async fn shutdown(&mut self) -> Result<(), DiscoverdError> {
        self.tx_term.send_replace(true);
        if let Some(handle) = self.acceptor_handle.take() {
            handle.await?;
        }
        Ok(())
    }

    async fn acceptor_task(
        listener: TcpListener,
        handler: Arc<HttpHandler>,
        mut rx_term: watch::Receiver<bool>,
    ) {
        pf_debug!("http acceptor task spawned");
        let mut conns = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            pf_warn!("error accepting connection: {}", e);
                            continue;
                        }
                    };
                    let handler = handler.clone();
                    conns.spawn(async move {
                        let service = service_fn(move |req| handler.clone().handle(req));
                        if let Err(e) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            pf_debug!("connection from {} ended: {}", peer, e);
                        }
                    });
                },

                Some(_) = conns.join_next(), if !conns.is_empty() => {},

                _ = rx_term.changed() => break,
            }
        }

        conns.shutdown().await;
        pf_debug!("http acceptor task exited");
    }
}

/// In-process peer for tests: HTTP listener on an ephemeral port whose
/// address doubles as the consensus member address.
#[cfg(test)]
pub(crate) struct TestPeer {
    pub(crate) store: Arc<Store>,
    pub(crate) handler: Arc<HttpHandler>,
    pub(crate) membership: Arc<Membership>,
    pub(crate) api: ExternalApi,
}

#[cfg(test)]
impl TestPeer {
    pub(crate) async fn start(
        cluster: &crate::server::MemCluster,
        config: crate::server::StoreConfig,
    ) -> Result<Self, DiscoverdError> {
        let handler = HttpHandler::new(Backend::Proxy(vec![]));
        let api = ExternalApi::setup("127.0.0.1:0".parse()?, handler.clone()).await?;
        let addr = api.local_addr().to_string();
        let membership = Membership::new(cluster.clone(), &addr, config, vec![addr.clone()]);
        handler.set_membership(membership.clone())?;
        let store = membership.promote(&handler).await?;
        Ok(TestPeer {
            store,
            handler,
            membership,
            api,
        })
    }

    pub(crate) fn addr(&self) -> String {
        self.api.local_addr().to_string()
    }

    pub(crate) fn client(&self) -> Result<crate::client::Client, DiscoverdError> {
        crate::client::Client::with_url(&self.addr())
    }

    pub(crate) async fn stop(mut self) -> Result<(), DiscoverdError> {
        self.api.shutdown().await?;
        self.membership.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod external_tests {
    use super::*;
    use crate::client::Client;
    use crate::model::{EventKind, LeaderType};
    use crate::server::{MemCluster, StoreConfig};
    use futures::StreamExt;
    use hyper_util::client::legacy::Client as HttpClient;
    use hyper_util::rt::TokioExecutor;
    use std::collections::BTreeMap;
    use tokio::time::{self, Duration};

    fn inst(addr: &str) -> Instance {
        Instance::new(addr, "tcp", BTreeMap::new())
    }

    fn keepalive_config() -> StoreConfig {
        StoreConfig {
            stream_keepalive_ms: 50,
            ..Default::default()
        }
    }

    fn proxy_peers(handler: &HttpHandler) -> Option<Vec<String>> {
        match handler.backend.load_full().as_ref() {
            Backend::Proxy(peers) => Some(peers.clone()),
            Backend::Local(_) => None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn manual_leader_election() -> Result<(), DiscoverdError> {
        let cluster = MemCluster::new();
        let peer = TestPeer::start(&cluster, StoreConfig::default()).await?;
        let client = peer.client()?;
        client.add_service("b", ServiceConfig::manual()).await?;
        let (i1, i2) = (inst("10.0.0.1:80"), inst("10.0.0.2:80"));
        client.add_instance("b", &i1).await?;
        client.add_instance("b", &i2).await?;

        assert_eq!(client.leader("b").await?, None);
        client.set_leader("b", &i1.id).await?;
        assert_eq!(client.leader("b").await?.map(|l| l.id), Some(i1.id.clone()));

        let mut leaders = client.leaders("b").await?;
        let first = time::timeout(Duration::from_secs(5), leaders.next()).await?;
        assert_eq!(first.transpose()?.flatten().map(|l| l.id), Some(i1.id.clone()));

        client.set_leader("b", &i2.id).await?;
        let second = time::timeout(Duration::from_secs(5), leaders.next()).await?;
        assert_eq!(second.transpose()?.flatten().map(|l| l.id), Some(i2.id.clone()));

        // removing the manual leader leaves no leader and emits nothing
        let mut downs = peer.store.subscribe("b", false, EventKinds::DOWN)?;
        client.remove_instance("b", &i2.id).await?;
        assert_eq!(downs.recv().await.map(|e| e.kind), Some(EventKind::Down));
        assert!(time::timeout(Duration::from_millis(200), leaders.next())
            .await
            .is_err());
        assert_eq!(client.leader("b").await?, None);

        // leader election type is fixed to manual for set_leader
        client.add_service("c", ServiceConfig::default()).await?;
        assert!(client
            .set_leader("c", &i1.id)
            .await
            .is_err_and(|e| e.is_validation()));
        assert_eq!(peer.store.config("b").map(|c| c.leader_type), Some(LeaderType::Manual));
        peer.stop().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn meta_compare_and_set() -> Result<(), DiscoverdError> {
        let cluster = MemCluster::new();
        let peer = TestPeer::start(&cluster, StoreConfig::default()).await?;
        let client = peer.client()?;
        client.add_service("a", ServiceConfig::default()).await?;

        assert_eq!(client.get_meta("a").await?, None);
        let mut meta = ServiceMeta::new("foo".into(), 0);
        client.set_meta("a", &mut meta).await?;
        let n = meta.index;
        assert!(n > 0);
        assert_eq!(client.get_meta("a").await?, Some(meta.clone()));

        let mut again = ServiceMeta::new("bar".into(), 0);
        assert!(client
            .set_meta("a", &mut again)
            .await
            .is_err_and(|e| e.is_exists()));
        let mut stale = ServiceMeta::new("bar".into(), n - 1);
        assert!(client
            .set_meta("a", &mut stale)
            .await
            .is_err_and(|e| e.is_precondition_failed()));
        let mut next = ServiceMeta::new("bar".into(), n);
        client.set_meta("a", &mut next).await?;
        assert!(next.index > n);
        peer.stop().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn follower_redirects_writes() -> Result<(), DiscoverdError> {
        let cluster = MemCluster::new();
        let leader = TestPeer::start(&cluster, StoreConfig::default()).await?;
        let follower = TestPeer::start(&cluster, StoreConfig::default()).await?;
        let client = follower.client()?;

        client.add_service("a", ServiceConfig::default()).await?;
        client.add_instance("a", &inst("10.0.0.1:80")).await?;
        assert_eq!(leader.store.instances("a")?.len(), 1);
        assert_eq!(leader.store.state_machine().heartbeat_count(), 1);
        assert_eq!(client.raft_leader().await?, leader.addr());
        assert_eq!(client.raft_peers().await?.len(), 2);

        // reads are served locally
        assert_eq!(client.addrs("a").await?, vec!["10.0.0.1:80".to_string()]);

        cluster.step_down();
        assert_eq!(
            client.add_service("b", ServiceConfig::default()).await,
            Err(DiscoverdError::NoKnownLeader)
        );
        assert_eq!(client.raft_leader().await, Err(DiscoverdError::NoKnownLeader));
        let status = client.status().await?;
        assert_eq!(status.data.status, "unhealthy");

        follower.stop().await?;
        leader.stop().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn error_mapping() -> Result<(), DiscoverdError> {
        let cluster = MemCluster::new();
        let peer = TestPeer::start(&cluster, StoreConfig::default()).await?;
        let client = peer.client()?;
        client.ping().await?;
        assert_eq!(client.status().await?.data.status, "healthy");

        assert!(client.instances("a").await.is_err_and(|e| e.is_not_found()));
        assert!(client
            .remove_service("a")
            .await
            .is_err_and(|e| e.is_not_found()));
        assert!(client
            .add_service("Bad_Name", ServiceConfig::default())
            .await
            .is_err_and(|e| e.is_validation()));

        client.add_service("a", ServiceConfig::default()).await?;
        assert!(client
            .add_service("a", ServiceConfig::default())
            .await
            .is_err_and(|e| e.is_exists()));
        assert_eq!(client.instances("a").await?, vec![]);

        let mut bad = inst("10.0.0.1:80");
        bad.proto = "TCP".into();
        assert!(client
            .add_instance("a", &bad)
            .await
            .is_err_and(|e| e.is_validation()));
        assert!(client
            .add_instance("nope", &inst("10.0.0.1:80"))
            .await
            .is_err_and(|e| e.is_not_found()));
        peer.stop().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn peer_headers_and_nodes() -> Result<(), DiscoverdError> {
        let cluster = MemCluster::new();
        let peer = TestPeer::start(&cluster, StoreConfig::default()).await?;
        let other = TestPeer::start(&cluster, StoreConfig::default()).await?;
        let client = peer.client()?;
        client.add_peer(&other.addr()).await?;
        client.add_peer(&other.addr()).await?;
        assert_eq!(client.raft_peers().await?.len(), 2);
        client.remove_peer(&other.addr()).await?;
        client.remove_peer(&other.addr()).await?;
        assert_eq!(client.raft_peers().await?, vec![peer.addr()]);

        // peers outside this process cannot be reached by the log
        assert!(client
            .add_peer("10.0.0.9:1111")
            .await
            .is_err_and(|e| e.is_validation()));
        assert_eq!(client.raft_peers().await?, vec![peer.addr()]);
        client.add_service("a", ServiceConfig::default()).await?;

        let http = HttpClient::builder(TokioExecutor::new())
            .build_http::<http_body_util::Empty<Bytes>>();
        let uri: http::Uri = format!("http://{}/ping", peer.addr()).parse()?;
        let resp = http.get(uri).await?;
        assert_eq!(resp.status(), StatusCode::OK);
        let peers = resp.headers().get(PEERS_HEADER).and_then(|v| v.to_str().ok());
        assert_eq!(peers, Some(peer.addr().as_str()));
        let index = resp.headers().get(INDEX_HEADER).and_then(|v| v.to_str().ok());
        assert_eq!(index, Some(peer.store.last_index().to_string().as_str()));
        other.stop().await?;
        peer.stop().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn proxy_mode_redirects() -> Result<(), DiscoverdError> {
        let cluster = MemCluster::new();
        let peer = TestPeer::start(&cluster, StoreConfig::default()).await?;
        let handler = HttpHandler::new(Backend::Proxy(vec![peer.addr()]));
        let mut proxy = ExternalApi::setup("127.0.0.1:0".parse()?, handler.clone()).await?;
        let client = Client::with_url(&proxy.local_addr().to_string())?;

        client.add_service("a", ServiceConfig::default()).await?;
        client.add_instance("a", &inst("10.0.0.1:80")).await?;
        assert_eq!(client.instances("a").await?.len(), 1);
        assert_eq!(peer.store.service_names(), vec!["a".to_string()]);

        handler.set_backend(Backend::Proxy(vec![]));
        assert_eq!(client.ping().await, Err(DiscoverdError::NoKnownLeader));

        proxy.shutdown().await?;
        peer.stop().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn instance_streams() -> Result<(), DiscoverdError> {
        let cluster = MemCluster::new();
        let peer = TestPeer::start(&cluster, keepalive_config()).await?;
        let client = peer.client()?;
        client.add_service("a", ServiceConfig::default()).await?;
        let x = inst("10.0.0.1:80");
        client.add_instance("a", &x).await?;

        let mut events = client.instance_events("a").await?;
        let first = events.next().await.transpose()?;
        assert_eq!(first.as_ref().map(|e| e.kind), Some(EventKind::Up));
        // instance streams carry no current marker
        client.remove_instance("a", &x.id).await?;
        let second = events.next().await.transpose()?;
        assert_eq!(second.map(|e| e.kind), Some(EventKind::Down));
        assert_eq!(peer.store.state_machine().subscriber_count("a"), 1);
        drop(events);

        // nothing is written to the service; keep-alives notice the hang-up
        let deadline = Instant::now() + Duration::from_secs(5);
        while peer.store.state_machine().subscriber_count("a") > 0 {
            assert!(Instant::now() < deadline, "stream outlived its client");
            time::sleep(Duration::from_millis(20)).await;
        }
        peer.stop().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn keepalive_keeps_quiet_stream() -> Result<(), DiscoverdError> {
        let cluster = MemCluster::new();
        let peer = TestPeer::start(&cluster, keepalive_config()).await?;
        let client = peer.client()?;
        client.add_service("a", ServiceConfig::default()).await?;

        let mut events = client.service_events("a").await?;
        let first = events.next().await.transpose()?;
        assert_eq!(first.map(|e| e.kind), Some(EventKind::Current));

        // several keep-alives pass silently
        assert!(time::timeout(Duration::from_millis(300), events.next())
            .await
            .is_err());
        assert_eq!(peer.store.state_machine().subscriber_count("a"), 1);

        let x = inst("10.0.0.1:80");
        client.add_instance("a", &x).await?;
        let up = time::timeout(Duration::from_secs(5), events.next()).await?;
        assert_eq!(up.transpose()?.and_then(|e| e.instance).map(|i| i.id), Some(x.id));
        drop(events);
        peer.stop().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remove_service_over_http() -> Result<(), DiscoverdError> {
        let cluster = MemCluster::new();
        let peer = TestPeer::start(&cluster, keepalive_config()).await?;
        let client = peer.client()?;
        client.add_service("a", ServiceConfig::default()).await?;
        let (x, y) = (inst("10.0.0.1:80"), inst("10.0.0.2:80"));
        client.add_instance("a", &x).await?;
        client.add_instance("a", &y).await?;

        let mut events = client.instance_events("a").await?;
        for _ in 0..2 {
            let up = events.next().await.transpose()?;
            assert_eq!(up.map(|e| e.kind), Some(EventKind::Up));
        }

        client.remove_service("a").await?;
        let mut downs = vec![];
        for _ in 0..2 {
            let event = time::timeout(Duration::from_secs(5), events.next())
                .await?
                .transpose()?
                .ok_or_else(|| DiscoverdError::msg("stream ended early"))?;
            assert_eq!(event.kind, EventKind::Down);
            downs.extend(event.instance.map(|i| i.id));
        }
        assert_eq!(downs, vec![x.id.clone(), y.id.clone()]);

        // the removal produces nothing beyond the downs
        assert!(time::timeout(Duration::from_millis(200), events.next())
            .await
            .is_err());
        let missing = client.instances("a").await;
        assert!(missing.is_err_and(|e| e.is_not_found()));

        // the subscription survives and sees the service come back
        client.add_service("a", ServiceConfig::default()).await?;
        client.add_instance("a", &x).await?;
        let up = time::timeout(Duration::from_secs(5), events.next()).await?;
        assert_eq!(up.transpose()?.map(|e| e.kind), Some(EventKind::Up));
        drop(events);
        peer.stop().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_refuses_requests() -> Result<(), DiscoverdError> {
        let cluster = MemCluster::new();
        let peer = TestPeer::start(&cluster, StoreConfig::default()).await?;
        let client = peer.client()?;
        client.add_service("a", ServiceConfig::default()).await?;

        let last_index = peer.store.last_index();
        assert_eq!(client.shutdown().await?, last_index);
        assert!(peer.handler.is_shutdown());
        assert!(peer.membership.store().await.is_none());

        assert_eq!(
            client.add_service("b", ServiceConfig::default()).await,
            Err(DiscoverdError::Shutdown)
        );
        assert_eq!(client.ping().await, Err(DiscoverdError::Shutdown));
        assert_eq!(client.shutdown().await, Err(DiscoverdError::Shutdown));
        assert_eq!(
            peer.store.add_service("b", ServiceConfig::default()).await,
            Err(DiscoverdError::Shutdown)
        );

        let http = HttpClient::builder(TokioExecutor::new())
            .build_http::<http_body_util::Empty<Bytes>>();
        let uri: http::Uri = format!("http://{}/services/a/instances", peer.addr()).parse()?;
        let resp = http.get(uri).await?;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = resp.into_body().collect().await?.to_bytes();
        let envelope: ErrorEnvelope = serde_json::from_slice(&body)?;
        assert_eq!(envelope.message, "discoverd: shutting down");
        assert!(envelope.retry);
        peer.stop().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn promote_and_demote() -> Result<(), DiscoverdError> {
        let cluster = MemCluster::new();
        let leader = TestPeer::start(&cluster, StoreConfig::default()).await?;
        leader.client()?.add_service("a", ServiceConfig::default()).await?;

        let handler = HttpHandler::new(Backend::Proxy(vec![leader.addr()]));
        let mut api = ExternalApi::setup("127.0.0.1:0".parse()?, handler.clone()).await?;
        let addr = api.local_addr().to_string();
        let membership = Membership::new(
            cluster.clone(),
            &addr,
            StoreConfig::default(),
            vec![leader.addr(), addr.clone()],
        );
        handler.set_membership(membership.clone())?;
        let client = Client::with_url(&addr)?;
        assert_eq!(proxy_peers(&handler), Some(vec![leader.addr()]));

        // served locally even though proxying
        client.promote().await?;
        assert_eq!(proxy_peers(&handler), None);
        let mut expect = vec![leader.addr(), addr.clone()];
        expect.sort();
        assert_eq!(client.raft_peers().await?, expect);
        assert_eq!(
            membership.store().await.map(|s| s.service_names()),
            Some(vec!["a".to_string()])
        );
        client.promote().await?;

        // writes now come through the member and redirect to the leader
        client.add_instance("a", &inst("10.0.0.1:80")).await?;
        assert_eq!(leader.store.instances("a")?.len(), 1);

        client.demote().await?;
        assert_eq!(proxy_peers(&handler), Some(vec![leader.addr()]));
        assert_eq!(leader.store.peers(), vec![leader.addr()]);
        assert_eq!(client.instances("a").await?.len(), 1);
        client.demote().await?;

        api.shutdown().await?;
        leader.stop().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lifecycle_needs_membership() -> Result<(), DiscoverdError> {
        let handler = HttpHandler::new(Backend::Proxy(vec!["10.0.0.1:1111".into()]));
        let mut api = ExternalApi::setup("127.0.0.1:0".parse()?, handler.clone()).await?;
        let client = Client::with_url(&api.local_addr().to_string())?;
        assert!(matches!(client.promote().await, Err(DiscoverdError::Unknown(_))));
        assert!(!handler.is_shutdown());
        api.shutdown().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversized_body_rejected() -> Result<(), DiscoverdError> {
        let cluster = MemCluster::new();
        let peer = TestPeer::start(&cluster, StoreConfig::default()).await?;
        let handler =
            HttpHandler::with_body_limit(Backend::Local(peer.store.clone()), 1024);
        let mut api = ExternalApi::setup("127.0.0.1:0".parse()?, handler).await?;
        let client = Client::with_url(&api.local_addr().to_string())?;
        client.add_service("a", ServiceConfig::default()).await?;

        let mut big = inst("10.0.0.1:80");
        big.meta.insert("blob".into(), "x".repeat(4096));
        assert!(matches!(
            client.add_instance("a", &big).await,
            Err(DiscoverdError::PayloadTooLarge(_))
        ));
        assert_eq!(peer.store.instances("a")?, vec![]);

        let http = HttpClient::builder(TokioExecutor::new())
            .build_http::<http_body_util::Full<Bytes>>();
        let req = Request::put(format!(
            "http://{}/services/b",
            api.local_addr()
        ))
        .body(Full::new(Bytes::from(vec![b' '; 2048])))?;
        let resp = http.request(req).await?;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(peer.store.config("b"), None);

        api.shutdown().await?;
        peer.stop().await
    }

    #[test]
    fn query_params_decoded() -> Result<(), DiscoverdError> {
        let req = Request::post("/raft/nodes?x=1&addr=%5Bfe80%3a%3A1%5D%3A1111&y")
            .body(())?;
        let (parts, _) = req.into_parts();
        assert_eq!(query_param(&parts, "addr").as_deref(), Some("[fe80::1]:1111"));
        assert_eq!(query_param(&parts, "y").as_deref(), Some(""));
        assert_eq!(query_param(&parts, "z"), None);

        let req = Request::post("/raft/nodes?addr=peer%2Eexample%3A1111+").body(())?;
        let (parts, _) = req.into_parts();
        assert_eq!(query_param(&parts, "addr").as_deref(), Some("peer.example:1111 "));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wait_for_first_instance() -> Result<(), DiscoverdError> {
        let cluster = MemCluster::new();
        let peer = TestPeer::start(&cluster, StoreConfig::default()).await?;
        let client = peer.client()?;

        assert!(matches!(
            client.wait_instances("a", Duration::from_millis(100)).await,
            Err(DiscoverdError::Timeout(_))
        ));

        let store = peer.store.clone();
        let x = inst("10.0.0.1:80");
        let adder = {
            let x = x.clone();
            tokio::spawn(async move {
                time::sleep(Duration::from_millis(100)).await;
                store.add_service("a", ServiceConfig::default()).await?;
                store.add_instance("a", &x).await
            })
        };
        let found = client.wait_instances("a", Duration::from_secs(5)).await?;
        assert_eq!(found, vec![Instance { index: found[0].index, ..x }]);
        adder.await??;

        // with instances present the plain list is used
        assert_eq!(client.wait_instances("a", Duration::ZERO).await?.len(), 1);
        peer.stop().await
    }
}
