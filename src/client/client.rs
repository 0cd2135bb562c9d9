//! HTTP client of the registry API: follows leader redirects, decodes error
//! envelopes back into typed errors, and turns SSE responses into event
//! streams.

use std::pin::Pin;

use crate::model::{Event, EventKind, Instance, ServiceConfig, ServiceMeta};
use crate::server::{ErrorEnvelope, RaftLeader, StatusReport, TargetLogIndex};
use crate::utils::DiscoverdError;

use bytes::Bytes;

use futures::{Stream, StreamExt};

use http::header::{self, HeaderValue};
use http::{Method, Request, Response, StatusCode, Uri};

use http_body_util::{BodyExt, BodyStream, Full};

use hyper::body::Incoming;

use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HttpClient;
use hyper_util::rt::TokioExecutor;

use serde::de::DeserializeOwned;
use serde::Serialize;

use tokio::time::{self, Duration};

/// Server URL used when `DISCOVERD` is not set.
pub const DEFAULT_URL: &str = "http://127.0.0.1:1111";

/// Redirect hops followed before giving up.
const MAX_REDIRECTS: usize = 10;

/// Stream of decoded server events. Ends on disconnect; a server-side
/// `error` frame or transport failure is yielded as the last item.
pub type EventStream =
    Pin<Box<dyn Stream<Item = Result<Event, DiscoverdError>> + Send>>;

/// Stream of service leader changes.
pub type LeaderStream =
    Pin<Box<dyn Stream<Item = Result<Option<Instance>, DiscoverdError>> + Send>>;

/// Incremental decoder of `text/event-stream` bodies.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    /// Appends raw body bytes.
    pub(crate) fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pops the next complete frame, if any.
    pub(crate) fn next_frame(&mut self) -> Option<Result<Event, DiscoverdError>> {
        loop {
            let end = self.buf.windows(2).position(|w| w == b"\n\n")?;
            let frame: Vec<u8> = self.buf.drain(..end + 2).collect();
            let text = String::from_utf8_lossy(&frame[..end]);

            let mut kind = None;
            let mut data = String::new();
            for line in text.lines() {
                if let Some(v) = line.strip_prefix("event:") {
                    kind = Some(v.trim().to_string());
                } else if let Some(v) = line.strip_prefix("data:") {
                    if !data.is_empty() {
                        data.push('\n');
                    }
                    data.push_str(v.strip_prefix(' ').unwrap_or(v));
                }
            }
            if kind.is_none() && data.is_empty() {
                continue; // comment or keep-alive
            }

            return Some(match kind.as_deref() {
                Some("error") => Err(stream_error(data)),
                _ => serde_json::from_str(&data).map_err(DiscoverdError::from),
            });
        }
    }
}

fn stream_error(msg: String) -> DiscoverdError {
    if msg == DiscoverdError::SendBlocked.to_string() {
        DiscoverdError::SendBlocked
    } else {
        DiscoverdError::Unknown(msg)
    }
}

fn event_stream(body: Incoming) -> EventStream {
    let body = Box::pin(BodyStream::new(body));
    let frames = futures::stream::unfold(
        (body, SseDecoder::default(), false),
        |(mut body, mut decoder, done)| async move {
            if done {
                return None;
            }
            loop {
                if let Some(item) = decoder.next_frame() {
                    let fatal = item.is_err();
                    return Some((item, (body, decoder, fatal)));
                }
                match body.next().await {
                    Some(Ok(frame)) => {
                        if let Ok(data) = frame.into_data() {
                            decoder.feed(&data);
                        }
                    }
                    Some(Err(e)) => {
                        return Some((Err(e.into()), (body, decoder, true)))
                    }
                    None => return None,
                }
            }
        },
    );
    Box::pin(frames)
}

/// Resolves a `Location` header against the URI that produced it.
fn redirect_target(
    from: &Uri,
    resp: &Response<Incoming>,
) -> Result<Uri, DiscoverdError> {
    let location = resp
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| DiscoverdError::msg("discoverd: redirect without location"))?;
    if location.starts_with('/') {
        let authority = from.authority().map_or("", |a| a.as_str());
        Ok(format!("http://{}{}", authority, location).parse()?)
    } else {
        Ok(location.parse()?)
    }
}

async fn read_json<T: DeserializeOwned>(
    resp: Response<Incoming>,
) -> Result<T, DiscoverdError> {
    let body = resp.into_body().collect().await?.to_bytes();
    Ok(serde_json::from_slice(&body)?)
}

async fn decode_error(resp: Response<Incoming>) -> DiscoverdError {
    let status = resp.status();
    let body = match resp.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return e.into(),
    };
    match serde_json::from_slice::<ErrorEnvelope>(&body) {
        Ok(env) => DiscoverdError::from_envelope(status.as_u16(), &env.code, env.message),
        Err(_) if status == StatusCode::SERVICE_UNAVAILABLE => {
            DiscoverdError::NoKnownLeader
        }
        Err(_) => DiscoverdError::Unknown(format!(
            "discoverd: unexpected status {}",
            status.as_u16()
        )),
    }
}

fn not_found_to_none<T>(
    result: Result<T, DiscoverdError>,
) -> Result<Option<T>, DiscoverdError> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// `/raft/nodes` path with `addr` escaped into the query.
fn nodes_path(addr: &str) -> String {
    let addr: String = form_urlencoded::byte_serialize(addr.as_bytes()).collect();
    format!("/raft/nodes?addr={}", addr)
}

/// Registry API client bound to one server URL.
#[derive(Clone)]
pub struct Client {
    /// Base URL, `http://host:port` without trailing slash.
    url: String,

    /// Pooled HTTP/1 client.
    http: HttpClient<HttpConnector, Full<Bytes>>,
}

impl Client {
    /// Creates a client for the URL in `DISCOVERD`, or the local default.
    pub fn new() -> Result<Self, DiscoverdError> {
        match std::env::var("DISCOVERD") {
            Ok(url) if !url.is_empty() => Self::with_url(&url),
            _ => Self::with_url(DEFAULT_URL),
        }
    }

    /// Creates a client for `url`; a missing scheme defaults to `http://`.
    pub fn with_url(url: &str) -> Result<Self, DiscoverdError> {
        let url = if url.starts_with("http://") || url.starts_with("https://") {
            url.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", url.trim_end_matches('/'))
        };
        url.parse::<Uri>()?;
        Ok(Client {
            url,
            http: HttpClient::builder(TokioExecutor::new()).build_http(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Sends a request, following redirects. Non-2xx answers become typed
    /// errors.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        stream: bool,
    ) -> Result<Response<Incoming>, DiscoverdError> {
        let body = Bytes::from(body.unwrap_or_default());
        let mut uri: Uri = format!("{}{}", self.url, path).parse()?;

        for _ in 0..MAX_REDIRECTS {
            let mut req = Request::builder()
                .method(method.clone())
                .uri(uri.clone())
                .body(Full::new(body.clone()))?;
            if !body.is_empty() {
                req.headers_mut().insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
            }
            if stream {
                req.headers_mut().insert(
                    header::ACCEPT,
                    HeaderValue::from_static("text/event-stream"),
                );
            }

            let resp = self.http.request(req).await?;
            let status = resp.status();
            if status.is_redirection() {
                uri = redirect_target(&uri, &resp)?;
                pf_trace!("{} {} redirected to {}", method, path, uri);
                continue;
            }
            if status.is_success() {
                return Ok(resp);
            }
            return Err(decode_error(resp).await);
        }

        Err(DiscoverdError::msg(format!(
            "discoverd: too many redirects for {}",
            path
        )))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, DiscoverdError> {
        let resp = self.send(Method::GET, path, None, false).await?;
        read_json(resp).await
    }

    async fn put<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Response<Incoming>, DiscoverdError> {
        let buf = serde_json::to_vec(body)?;
        self.send(Method::PUT, path, Some(buf), false).await
    }

    async fn delete(&self, path: &str) -> Result<(), DiscoverdError> {
        self.send(Method::DELETE, path, None, false).await?;
        Ok(())
    }

    /// Opens an SSE stream on `path`.
    pub async fn stream(&self, path: &str) -> Result<EventStream, DiscoverdError> {
        let resp = self.send(Method::GET, path, None, true).await?;
        Ok(event_stream(resp.into_body()))
    }
}

// Client registry API implementation
impl Client {
    pub async fn ping(&self) -> Result<(), DiscoverdError> {
        self.send(Method::GET, "/ping", None, false).await?;
        Ok(())
    }

    pub async fn status(&self) -> Result<StatusReport, DiscoverdError> {
        self.get("/.well-known/status").await
    }

    /// Creates a service. The default config elects the oldest instance.
    pub async fn add_service(
        &self,
        service: &str,
        config: ServiceConfig,
    ) -> Result<(), DiscoverdError> {
        self.put(&format!("/services/{}", service), &config).await?;
        Ok(())
    }

    pub async fn remove_service(&self, service: &str) -> Result<(), DiscoverdError> {
        self.delete(&format!("/services/{}", service)).await
    }

    /// Registers or heartbeats an instance.
    pub async fn add_instance(
        &self,
        service: &str,
        inst: &Instance,
    ) -> Result<(), DiscoverdError> {
        self.put(&format!("/services/{}/instances/{}", service, inst.id), inst)
            .await?;
        Ok(())
    }

    pub async fn remove_instance(
        &self,
        service: &str,
        id: &str,
    ) -> Result<(), DiscoverdError> {
        self.delete(&format!("/services/{}/instances/{}", service, id))
            .await
    }

    /// Current instances of a service.
    pub async fn instances(&self, service: &str) -> Result<Vec<Instance>, DiscoverdError> {
        self.get(&format!("/services/{}/instances", service)).await
    }

    /// Like `instances`, but if there are none yet waits up to `timeout`
    /// for the first one to come up.
    pub async fn wait_instances(
        &self,
        service: &str,
        timeout: Duration,
    ) -> Result<Vec<Instance>, DiscoverdError> {
        match self.instances(service).await {
            Ok(list) if !list.is_empty() => return Ok(list),
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let mut events = self.service_events(service).await?;
        let mut found = vec![];
        while let Some(event) = events.next().await {
            let event = event?;
            match event.kind {
                EventKind::Current => break,
                EventKind::Up => found.extend(event.instance),
                _ => {}
            }
        }
        if !found.is_empty() {
            return Ok(found);
        }

        let first_up = async {
            while let Some(event) = events.next().await {
                let event = event?;
                if let (EventKind::Up, Some(inst)) = (event.kind, event.instance) {
                    return Ok(vec![inst]);
                }
            }
            Err(DiscoverdError::msg("discoverd: event stream closed"))
        };
        time::timeout(timeout, first_up).await.map_err(|_| {
            DiscoverdError::Timeout("discoverd: timed out waiting for instances".into())
        })?
    }

    /// Addresses of the current instances of a service.
    pub async fn addrs(&self, service: &str) -> Result<Vec<String>, DiscoverdError> {
        Ok(self
            .instances(service)
            .await?
            .into_iter()
            .map(|inst| inst.addr)
            .collect())
    }

    /// Current leader of a service, `None` if there is none.
    pub async fn leader(&self, service: &str) -> Result<Option<Instance>, DiscoverdError> {
        not_found_to_none(self.get(&format!("/services/{}/leader", service)).await)
    }

    /// Stream of leader changes, starting with the current leader.
    pub async fn leaders(&self, service: &str) -> Result<LeaderStream, DiscoverdError> {
        let events = self.stream(&format!("/services/{}/leader", service)).await?;
        let leaders = events.filter_map(|event| async move {
            match event {
                Ok(event) if event.kind == EventKind::Leader => Some(Ok(event.instance)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            }
        });
        Ok(Box::pin(leaders))
    }

    /// Installs a manual leader.
    pub async fn set_leader(&self, service: &str, id: &str) -> Result<(), DiscoverdError> {
        let body = serde_json::json!({ "id": id });
        self.put(&format!("/services/{}/leader", service), &body)
            .await?;
        Ok(())
    }

    /// Service metadata, `None` if never set.
    pub async fn get_meta(
        &self,
        service: &str,
    ) -> Result<Option<ServiceMeta>, DiscoverdError> {
        not_found_to_none(self.get(&format!("/services/{}/meta", service)).await)
    }

    /// CAS-writes metadata; on success `meta.index` is updated to the index
    /// of the write.
    pub async fn set_meta(
        &self,
        service: &str,
        meta: &mut ServiceMeta,
    ) -> Result<(), DiscoverdError> {
        let resp = self.put(&format!("/services/{}/meta", service), meta).await?;
        let stored: ServiceMeta = read_json(resp).await?;
        meta.index = stored.index;
        Ok(())
    }

    /// All events of a service, starting with its current state.
    pub async fn service_events(&self, service: &str) -> Result<EventStream, DiscoverdError> {
        self.stream(&format!("/services/{}", service)).await
    }

    /// Instance events of a service, starting with its current instances.
    pub async fn instance_events(
        &self,
        service: &str,
    ) -> Result<EventStream, DiscoverdError> {
        self.stream(&format!("/services/{}/instances", service)).await
    }
}

// Client cluster API implementation
impl Client {
    /// Address of the cluster leader.
    pub async fn raft_leader(&self) -> Result<String, DiscoverdError> {
        let leader: RaftLeader = self.get("/raft/leader").await?;
        Ok(leader.host)
    }

    pub async fn raft_peers(&self) -> Result<Vec<String>, DiscoverdError> {
        self.get("/raft/peers").await
    }

    /// Adds a peer; returns the log index the cluster was at.
    pub async fn add_peer(&self, addr: &str) -> Result<u64, DiscoverdError> {
        let resp = self
            .send(Method::POST, &nodes_path(addr), None, false)
            .await?;
        let target: TargetLogIndex = read_json(resp).await?;
        Ok(target.last_index)
    }

    pub async fn remove_peer(&self, addr: &str) -> Result<(), DiscoverdError> {
        self.send(Method::DELETE, &nodes_path(addr), None, false)
            .await?;
        Ok(())
    }

    /// Shuts the peer down; returns the last log index it applied.
    pub async fn shutdown(&self) -> Result<u64, DiscoverdError> {
        let resp = self.send(Method::POST, "/shutdown", None, false).await?;
        let target: TargetLogIndex = read_json(resp).await?;
        Ok(target.last_index)
    }

    /// Turns the peer into a consensus member.
    pub async fn promote(&self) -> Result<(), DiscoverdError> {
        self.send(Method::POST, "/raft/promote", None, false).await?;
        Ok(())
    }

    /// Turns the peer into a proxy.
    pub async fn demote(&self) -> Result<(), DiscoverdError> {
        self.send(Method::POST, "/raft/demote", None, false).await?;
        Ok(())
    }
}
