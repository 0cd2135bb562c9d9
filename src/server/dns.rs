//! DNS view of the registry over UDP and TCP. Names under the configured
//! domain are answered from the store; everything else is forwarded to the
//! configured recursors.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::client::Client;
use crate::model::Instance;
use crate::server::Store;
use crate::utils::DiscoverdError;

use arc_swap::ArcSwap;

use async_trait::async_trait;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, SOA, SRV};
use hickory_proto::rr::{Name, RData, Record, RecordType};

use rand::seq::SliceRandom;
use rand::Rng;

use serde::{Deserialize, Serialize};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Duration};

/// Largest datagram accepted or forwarded.
const MAX_UDP_SIZE: usize = 4096;

/// TTL attached to every record served.
const RECORD_TTL: u32 = 0;

/// DNS server tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Authoritative zone, fully qualified.
    pub domain: String,

    /// Upstream servers for names outside `domain`, tried in order.
    pub recursors: Vec<String>,

    /// Bound on a single upstream exchange.
    pub recursor_timeout_ms: u64,

    /// Answer records per set over UDP.
    pub max_udp_records: usize,
}

impl Default for DnsConfig {
    fn default() -> Self {
        DnsConfig {
            domain: "discoverd.".into(),
            recursors: vec![],
            recursor_timeout_ms: 2_000,
            max_udp_records: 3,
        }
    }
}

impl DnsConfig {
    /// Overlays fields from a TOML string onto the defaults.
    pub fn parse(config_str: Option<&str>) -> Result<Self, DiscoverdError> {
        let mut config = parsed_config!(config_str => DnsConfig;
                                        domain, recursors,
                                        recursor_timeout_ms, max_udp_records)?;
        config.domain = config.domain.to_lowercase();
        if !config.domain.ends_with('.') {
            config.domain.push('.');
        }
        if config.domain == "." {
            return Err(DiscoverdError::Validation(
                "dns domain must not be the root".into(),
            ));
        }
        Ok(config)
    }
}

/// Adds the default port to a recursor address lacking one.
fn with_default_port(recursor: &str) -> String {
    if recursor.parse::<SocketAddr>().is_ok() {
        return recursor.into();
    }
    match recursor.parse::<IpAddr>() {
        Ok(IpAddr::V6(ip)) => format!("[{}]:53", ip),
        Ok(IpAddr::V4(ip)) => format!("{}:53", ip),
        Err(_) if recursor.contains(':') => recursor.into(),
        Err(_) => format!("{}:53", recursor),
    }
}

/// Resolves recursor addresses, defaulting the port to 53.
pub async fn normalize_recursors(
    recursors: &[String],
) -> Result<Vec<SocketAddr>, DiscoverdError> {
    let mut addrs = Vec::with_capacity(recursors.len());
    for r in recursors {
        let full = with_default_port(r);
        let resolved = lookup_host(full.as_str()).await.map_err(|e| {
            DiscoverdError::Validation(format!(
                "discoverd: unable to resolve recursor address {}: {}",
                r, e
            ))
        })?;
        match resolved.into_iter().next() {
            Some(addr) => addrs.push(addr),
            None => {
                return Err(DiscoverdError::Validation(format!(
                    "discoverd: invalid recursor address {}",
                    r
                )))
            }
        };
    }
    Ok(addrs)
}

/// Read access the DNS server needs.
#[async_trait]
pub trait DnsStore: Send + Sync {
    /// Instances of `service`; `ObjectNotFound` if it does not exist.
    async fn instances(&self, service: &str) -> Result<Vec<Instance>, DiscoverdError>;

    /// Current leader of `service`, if any.
    async fn service_leader(
        &self,
        service: &str,
    ) -> Result<Option<Instance>, DiscoverdError>;
}

#[async_trait]
impl DnsStore for Arc<Store> {
    async fn instances(&self, service: &str) -> Result<Vec<Instance>, DiscoverdError> {
        Store::instances(self, service)
    }

    async fn service_leader(
        &self,
        service: &str,
    ) -> Result<Option<Instance>, DiscoverdError> {
        Ok(Store::service_leader(self, service))
    }
}

/// Answers reads through the HTTP API of a random peer. Used by nodes that
/// are not part of the consensus membership.
pub struct ProxyStore {
    peers: Vec<String>,
}

impl ProxyStore {
    pub fn new(peers: Vec<String>) -> Self {
        ProxyStore { peers }
    }

    fn pick(&self) -> Result<Client, DiscoverdError> {
        if self.peers.is_empty() {
            return Err(DiscoverdError::NoKnownLeader);
        }
        let peer = &self.peers[rand::thread_rng().gen_range(0..self.peers.len())];
        Client::with_url(peer)
    }
}

#[async_trait]
impl DnsStore for ProxyStore {
    async fn instances(&self, service: &str) -> Result<Vec<Instance>, DiscoverdError> {
        self.pick()?.instances(service).await
    }

    async fn service_leader(
        &self,
        service: &str,
    ) -> Result<Option<Instance>, DiscoverdError> {
        self.pick()?.leader(service).await
    }
}

/// Which name schema a query under the domain matched.
#[derive(Debug, PartialEq, Eq)]
enum Lookup {
    /// `<service>`
    Service { service: String },

    /// `_<service>._<proto>`
    Srv { service: String, proto: String },

    /// `<id>.<service>._i`
    Instance { service: String, id: String },

    /// `leader.<service>`
    Leader { service: String },
}

impl Lookup {
    fn parse(labels: &[&str]) -> Option<Self> {
        match labels {
            [service] => Some(Lookup::Service {
                service: (*service).into(),
            }),
            [s, p] if s.starts_with('_') && p.starts_with('_') => Some(Lookup::Srv {
                service: s[1..].into(),
                proto: p[1..].into(),
            }),
            [id, service, "_i"] => Some(Lookup::Instance {
                service: (*service).into(),
                id: (*id).into(),
            }),
            ["leader", service] => Some(Lookup::Leader {
                service: (*service).into(),
            }),
            _ => None,
        }
    }
}

/// Address pieces of an instance as used in records.
struct AddrData {
    ip: IpAddr,
    port: u16,
    id: String,
}

impl AddrData {
    fn of(inst: &Instance) -> Option<Self> {
        Some(AddrData {
            ip: inst.ip()?,
            port: inst.port(),
            id: inst.id.clone(),
        })
    }

    fn fits(&self, qtype: RecordType) -> bool {
        match qtype {
            RecordType::A => self.ip.is_ipv4(),
            RecordType::AAAA => self.ip.is_ipv6(),
            _ => true,
        }
    }
}

fn addr_record(name: Name, addr: &AddrData) -> Record {
    let rdata = match addr.ip {
        IpAddr::V4(ip) => RData::A(A(ip)),
        IpAddr::V6(ip) => RData::AAAA(AAAA(ip)),
    };
    Record::from_rdata(name, RECORD_TTL, rdata)
}

/// Answer under construction for an authoritative lookup.
struct Reply {
    rcode: ResponseCode,
    answers: Vec<Record>,
    additionals: Vec<Record>,
}

impl Reply {
    fn empty() -> Self {
        Reply {
            rcode: ResponseCode::NoError,
            answers: vec![],
            additionals: vec![],
        }
    }

    fn nxdomain() -> Self {
        Reply {
            rcode: ResponseCode::NXDomain,
            ..Self::empty()
        }
    }
}

/// Query handling shared by the UDP and TCP listeners.
struct DnsApi {
    config: DnsConfig,

    /// Recursors after normalisation.
    recursors: Vec<SocketAddr>,

    /// Backing store, swappable at runtime.
    store: ArcSwap<Box<dyn DnsStore>>,
}

impl DnsApi {
    /// Handles one wire-format request and returns the wire-format reply,
    /// or `None` if the request is not even parseable.
    async fn serve(&self, buf: &[u8], tcp: bool) -> Option<Vec<u8>> {
        let req = match Message::from_vec(buf) {
            Ok(req) => req,
            Err(e) => {
                pf_debug!("dropping malformed dns request: {}", e);
                return None;
            }
        };

        let in_domain = req
            .queries()
            .first()
            .is_some_and(|q| self.relative_labels(q.name()).is_some());
        let res = if in_domain {
            self.lookup(&req, tcp).await
        } else if !self.recursors.is_empty() {
            if let Some(raw) = self.recurse(buf, tcp).await {
                return Some(raw);
            }
            Ok(self.failure(&req, ResponseCode::ServFail))
        } else {
            Ok(self.failure(&req, ResponseCode::ServFail))
        };

        let res = res.unwrap_or_else(|e| {
            pf_warn!("dns lookup failed: {}", e);
            self.failure(&req, ResponseCode::ServFail)
        });
        match res.to_vec() {
            Ok(raw) => Some(raw),
            Err(e) => {
                pf_error!("error encoding dns reply: {}", e);
                None
            }
        }
    }

    /// Lowercased labels of `name` below the domain, `None` if outside it.
    fn relative_labels(&self, name: &Name) -> Option<Vec<String>> {
        let mut fqdn = name.to_ascii().to_lowercase();
        if !fqdn.ends_with('.') {
            fqdn.push('.');
        }
        let rest = fqdn.strip_suffix(&self.config.domain)?;
        if !rest.is_empty() && !rest.ends_with('.') {
            return None;
        }
        Some(
            rest.split('.')
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect(),
        )
    }

    fn reply_header(&self, req: &Message) -> Message {
        let mut res = Message::new();
        res.set_id(req.id())
            .set_message_type(MessageType::Response)
            .set_op_code(req.op_code())
            .set_recursion_desired(req.recursion_desired())
            .set_recursion_available(!self.recursors.is_empty());
        for q in req.queries() {
            res.add_query(q.clone());
        }
        res
    }

    fn failure(&self, req: &Message, rcode: ResponseCode) -> Message {
        let mut res = self.reply_header(req);
        res.set_recursion_available(true).set_response_code(rcode);
        res
    }

    fn soa_record(&self) -> Result<Record, DiscoverdError> {
        let domain = Name::from_ascii(&self.config.domain)?;
        let serial = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs() as u32);
        let soa = SOA::new(
            Name::from_ascii(format!("ns.{}", self.config.domain))?,
            Name::from_ascii(format!("postmaster.{}", self.config.domain))?,
            serial,
            3600,
            600,
            86400,
            0,
        );
        Ok(Record::from_rdata(domain, RECORD_TTL, RData::SOA(soa)))
    }

    fn instance_domain(&self, service: &str, id: &str) -> Result<Name, DiscoverdError> {
        Ok(Name::from_ascii(format!(
            "{}.{}._i.{}",
            id, service, self.config.domain
        ))?)
    }

    async fn lookup(&self, req: &Message, tcp: bool) -> Result<Message, DiscoverdError> {
        let mut res = self.reply_header(req);
        res.set_authoritative(true);
        let Some(query) = req.queries().first() else {
            return Ok(res);
        };
        let qname = query.name().clone();
        let qtype = query.query_type();

        let labels = self.relative_labels(&qname).unwrap_or_default();
        let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
        let reply = match Lookup::parse(&labels) {
            Some(lookup) => self.assemble(lookup, qname, qtype, tcp).await?,
            None => Reply::nxdomain(),
        };

        res.set_response_code(reply.rcode);
        let mut answers = reply.answers;
        if reply.rcode == ResponseCode::NoError && qtype == RecordType::SOA {
            answers = vec![self.soa_record()?];
        }
        if answers.is_empty() {
            res.add_name_server(self.soa_record()?);
        }
        for r in answers {
            res.add_answer(r);
        }
        for r in reply.additionals {
            res.add_additional(r);
        }
        Ok(res)
    }

    async fn assemble(
        &self,
        lookup: Lookup,
        qname: Name,
        qtype: RecordType,
        tcp: bool,
    ) -> Result<Reply, DiscoverdError> {
        let store = self.store.load_full();

        let (service, proto, single) = match lookup {
            Lookup::Service { service } => (service, None, None),
            Lookup::Srv { service, proto } => (service, Some(proto), None),
            Lookup::Instance { service, id } => {
                let found = match store.instances(&service).await {
                    Ok(list) => list.into_iter().find(|i| i.id == id),
                    Err(e) if e.is_not_found() => None,
                    Err(e) => {
                        pf_warn!("dns: cannot retrieve instances: {}", e);
                        None
                    }
                };
                (service, None, Some(found))
            }
            Lookup::Leader { service } => {
                let found = match store.service_leader(&service).await {
                    Ok(leader) => leader,
                    Err(e) => {
                        pf_warn!("dns: cannot retrieve service leader: {}", e);
                        None
                    }
                };
                (service, None, Some(found))
            }
        };

        if let Some(found) = single {
            let Some(addr) = found.as_ref().and_then(AddrData::of) else {
                return Ok(Reply::nxdomain());
            };
            return Ok(Self::single_answer(qname, qtype, tcp, &addr));
        }

        let instances = match store.instances(&service).await {
            Ok(list) => list,
            Err(e) => {
                if !e.is_not_found() {
                    pf_warn!("dns: cannot retrieve instances: {}", e);
                }
                return Ok(Reply::nxdomain());
            }
        };
        if qtype == RecordType::SOA {
            return Ok(Reply::empty());
        }

        let mut seen = Vec::<IpAddr>::new();
        let mut addrs = Vec::with_capacity(instances.len());
        for inst in &instances {
            if proto.as_ref().is_some_and(|p| *p != inst.proto) {
                continue;
            }
            let Some(addr) = AddrData::of(inst) else {
                continue;
            };
            if seen.contains(&addr.ip) || !addr.fits(qtype) {
                continue;
            }
            if qtype != RecordType::SRV {
                seen.push(addr.ip);
            }
            addrs.push(addr);
        }

        addrs.shuffle(&mut rand::thread_rng());
        if !tcp {
            addrs.truncate(self.config.max_udp_records);
        }

        let mut reply = Reply::empty();
        if matches!(qtype, RecordType::ANY | RecordType::A | RecordType::AAAA) {
            for addr in &addrs {
                reply.answers.push(addr_record(qname.clone(), addr));
            }
        }
        if matches!(qtype, RecordType::ANY | RecordType::SRV) {
            for addr in &addrs {
                let target = self.instance_domain(&service, &addr.id)?;
                let srv = SRV::new(1, 1, addr.port, target);
                reply
                    .answers
                    .push(Record::from_rdata(qname.clone(), RECORD_TTL, RData::SRV(srv)));
            }
        }
        if qtype == RecordType::SRV && tcp {
            for addr in &addrs {
                let target = self.instance_domain(&service, &addr.id)?;
                reply.additionals.push(addr_record(target, addr));
            }
        }
        Ok(reply)
    }

    /// Answer for a lookup resolving to exactly one instance.
    fn single_answer(qname: Name, qtype: RecordType, tcp: bool, addr: &AddrData) -> Reply {
        let mut reply = Reply::empty();
        let wanted = matches!(
            qtype,
            RecordType::A | RecordType::AAAA | RecordType::ANY | RecordType::SRV
        );
        if !wanted || !addr.fits(qtype) {
            return reply;
        }
        if qtype != RecordType::SRV {
            reply.answers.push(addr_record(qname.clone(), addr));
        }
        if matches!(qtype, RecordType::SRV | RecordType::ANY) {
            let srv = SRV::new(1, 1, addr.port, qname.clone());
            reply
                .answers
                .push(Record::from_rdata(qname.clone(), RECORD_TTL, RData::SRV(srv)));
        }
        if tcp && qtype == RecordType::SRV {
            reply.additionals.push(addr_record(qname, addr));
        }
        reply
    }

    /// Forwards the raw request to each recursor in turn over the same
    /// transport it arrived on. `None` if every recursor failed.
    async fn recurse(&self, buf: &[u8], tcp: bool) -> Option<Vec<u8>> {
        let bound = Duration::from_millis(self.config.recursor_timeout_ms);
        for recursor in &self.recursors {
            let exchange = async {
                if tcp {
                    exchange_tcp(*recursor, buf).await
                } else {
                    exchange_udp(*recursor, buf).await
                }
            };
            match time::timeout(bound, exchange).await {
                Ok(Ok(raw)) => return Some(raw),
                Ok(Err(e)) => pf_debug!("recursor {} failed: {}", recursor, e),
                Err(_) => pf_debug!("recursor {} timed out", recursor),
            }
        }
        None
    }
}

async fn exchange_udp(server: SocketAddr, buf: &[u8]) -> Result<Vec<u8>, DiscoverdError> {
    let local: SocketAddr = if server.is_ipv4() {
        "0.0.0.0:0".parse()?
    } else {
        "[::]:0".parse()?
    };
    let sock = UdpSocket::bind(local).await?;
    sock.connect(server).await?;
    sock.send(buf).await?;
    let mut resp = vec![0; MAX_UDP_SIZE];
    let n = sock.recv(&mut resp).await?;
    resp.truncate(n);
    Ok(resp)
}

async fn exchange_tcp(server: SocketAddr, buf: &[u8]) -> Result<Vec<u8>, DiscoverdError> {
    let mut stream = TcpStream::connect(server).await?;
    write_frame(&mut stream, buf).await?;
    read_frame(&mut stream).await
}

/// Reads one length-prefixed DNS message off a TCP stream.
async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>, DiscoverdError> {
    let len = stream.read_u16().await? as usize;
    let mut buf = vec![0; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Writes one length-prefixed DNS message onto a TCP stream.
async fn write_frame(stream: &mut TcpStream, buf: &[u8]) -> Result<(), DiscoverdError> {
    let len = u16::try_from(buf.len())
        .map_err(|_| DiscoverdError::msg("dns message too large"))?;
    stream.write_u16(len).await?;
    stream.write_all(buf).await?;
    Ok(())
}

/// Cloneable handle to the store behind a running `DnsServer`.
#[derive(Clone)]
pub struct DnsStoreSwitch {
    api: Arc<DnsApi>,
}

impl DnsStoreSwitch {
    pub fn set_store(&self, store: Box<dyn DnsStore>) {
        self.api.store.store(Arc::new(store));
    }
}

/// DNS listener pair of a peer.
pub struct DnsServer {
    /// Shared query handler.
    api: Arc<DnsApi>,

    /// Bound UDP address.
    udp_addr: SocketAddr,

    /// Bound TCP address.
    tcp_addr: SocketAddr,

    /// Sender side of the termination channel.
    tx_term: watch::Sender<bool>,

    /// Join handles of the UDP reader and TCP acceptor tasks.
    handles: Vec<JoinHandle<()>>,
}

// DnsServer public API implementation
impl DnsServer {
    /// Binds both listeners and starts serving from `store`.
    pub async fn setup(
        udp_addr: SocketAddr,
        tcp_addr: SocketAddr,
        config: DnsConfig,
        store: Box<dyn DnsStore>,
    ) -> Result<Self, DiscoverdError> {
        let recursors = normalize_recursors(&config.recursors).await?;
        let api = Arc::new(DnsApi {
            config,
            recursors,
            store: ArcSwap::from_pointee(store),
        });

        let udp = UdpSocket::bind(udp_addr).await?;
        let tcp = TcpListener::bind(tcp_addr).await?;
        let udp_addr = udp.local_addr()?;
        let tcp_addr = tcp.local_addr()?;
        let (tx_term, rx_term) = watch::channel(false);

        let handles = vec![
            tokio::spawn(Self::udp_reader_task(
                Arc::new(udp),
                api.clone(),
                rx_term.clone(),
            )),
            tokio::spawn(Self::tcp_acceptor_task(tcp, api.clone(), rx_term)),
        ];
        pf_info!(
            "dns serving {} on udp {} tcp {}",
            api.config.domain,
            udp_addr,
            tcp_addr
        );

        Ok(DnsServer {
            api,
            udp_addr,
            tcp_addr,
            tx_term,
            handles,
        })
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    /// Points subsequent lookups at a different store.
    pub fn set_store(&self, store: Box<dyn DnsStore>) {
        self.api.store.store(Arc::new(store));
    }

    /// Handle that can repoint this server's store from elsewhere.
    pub fn store_switch(&self) -> DnsStoreSwitch {
        DnsStoreSwitch {
            api: self.api.clone(),
        }
    }

    /// Stops both listeners.
    pub async fn shutdown(&mut self) -> Result<(), DiscoverdError> {
        self.tx_term.send_replace(true);
        for handle in self.handles.drain(..) {
            handle.await?;
        }
        Ok(())
    }
}

// DnsServer listener tasks
impl DnsServer {
    async fn udp_reader_task(
        sock: Arc<UdpSocket>,
        api: Arc<DnsApi>,
        mut rx_term: watch::Receiver<bool>,
    ) {
        pf_debug!("dns udp reader task spawned");
        let mut buf = vec![0; MAX_UDP_SIZE];
        let mut queries = JoinSet::new();

        loop {
            tokio::select! {
                recvd = sock.recv_from(&mut buf) => {
                    let (n, peer) = match recvd {
                        Ok(r) => r,
                        Err(e) => {
                            pf_warn!("error receiving dns datagram: {}", e);
                            continue;
                        }
                    };
                    let req = buf[..n].to_vec();
                    let (sock, api) = (sock.clone(), api.clone());
                    queries.spawn(async move {
                        if let Some(res) = api.serve(&req, false).await {
                            if let Err(e) = sock.send_to(&res, peer).await {
                                pf_debug!("error replying to {}: {}", peer, e);
                            }
                        }
                    });
                },

                Some(_) = queries.join_next(), if !queries.is_empty() => {},

                _ = rx_term.changed() => break,
            }
        }

        queries.shutdown().await;
        pf_debug!("dns udp reader task exited");
    }

    async fn tcp_acceptor_task(
        listener: TcpListener,
        api: Arc<DnsApi>,
        mut rx_term: watch::Receiver<bool>,
    ) {
        pf_debug!("dns tcp acceptor task spawned");
        let mut conns = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            pf_warn!("error accepting dns connection: {}", e);
                            continue;
                        }
                    };
                    conns.spawn(Self::tcp_conn_task(stream, peer, api.clone()));
                },

                Some(_) = conns.join_next(), if !conns.is_empty() => {},

                _ = rx_term.changed() => break,
            }
        }

        conns.shutdown().await;
        pf_debug!("dns tcp acceptor task exited");
    }

    async fn tcp_conn_task(mut stream: TcpStream, peer: SocketAddr, api: Arc<DnsApi>) {
        loop {
            let req = match read_frame(&mut stream).await {
                Ok(req) => req,
                Err(_) => break, // peer closed
            };
            let Some(res) = api.serve(&req, true).await else {
                break;
            };
            if let Err(e) = write_frame(&mut stream, &res).await {
                pf_debug!("error replying to {}: {}", peer, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod dns_tests {
    use super::*;
    use crate::model::ServiceConfig;
    use crate::server::{MemCluster, StoreConfig};
    use hickory_proto::op::Query;
    use std::collections::{BTreeMap, BTreeSet};

    async fn query(
        server: &DnsServer,
        name: &str,
        qtype: RecordType,
        tcp: bool,
    ) -> Result<Message, DiscoverdError> {
        let mut req = Message::new();
        req.set_id(rand::random())
            .set_recursion_desired(true)
            .add_query(Query::query(Name::from_ascii(name)?, qtype));
        let buf = req.to_vec()?;

        let raw = if tcp {
            exchange_tcp(server.tcp_addr(), &buf).await?
        } else {
            exchange_udp(server.udp_addr(), &buf).await?
        };
        let res = Message::from_vec(&raw)?;
        assert_eq!(res.id(), req.id());
        Ok(res)
    }

    async fn setup_store() -> Result<(Arc<Store>, Vec<Instance>), DiscoverdError> {
        let cluster = MemCluster::new();
        let store = Store::open_in(&cluster, "127.0.0.1:1111", StoreConfig::default())?;
        store.add_service("a", ServiceConfig::default()).await?;
        let mut insts = vec![];
        for addr in ["192.168.0.1:80", "192.168.0.2:81", "192.168.0.3:82"] {
            let inst = Instance::new(addr, "tcp", BTreeMap::new());
            store.add_instance("a", &inst).await?;
            insts.push(inst);
        }
        Ok((store, insts))
    }

    async fn setup_server(
        store: Box<dyn DnsStore>,
        config: DnsConfig,
    ) -> Result<DnsServer, DiscoverdError> {
        let local: SocketAddr = "127.0.0.1:0".parse()?;
        DnsServer::setup(local, local, config, store).await
    }

    fn count(records: &[Record], rtype: RecordType) -> usize {
        records.iter().filter(|r| r.record_type() == rtype).count()
    }

    fn srv_targets(records: &[Record]) -> BTreeSet<String> {
        records
            .iter()
            .filter_map(|r| match r.data() {
                Some(RData::SRV(srv)) => Some(srv.target().to_ascii()),
                _ => None,
            })
            .collect()
    }

    fn expected_targets(insts: &[Instance]) -> BTreeSet<String> {
        insts
            .iter()
            .map(|i| format!("{}.a._i.discoverd.", i.id))
            .collect()
    }

    #[test]
    fn parse_dns_config() -> Result<(), DiscoverdError> {
        let config = DnsConfig::parse(Some("domain = 'Disco'\nrecursors = ['8.8.8.8']"))?;
        assert_eq!(config.domain, "disco.");
        assert_eq!(config.recursors, vec!["8.8.8.8".to_string()]);
        assert_eq!(config.max_udp_records, 3);
        assert!(DnsConfig::parse(Some("domain = '.'")).is_err());
        assert!(DnsConfig::parse(Some("zone = 'x.'")).is_err());
        Ok(())
    }

    #[test]
    fn lookup_shapes() {
        assert_eq!(
            Lookup::parse(&["a"]),
            Some(Lookup::Service { service: "a".into() })
        );
        assert_eq!(
            Lookup::parse(&["_a", "_tcp"]),
            Some(Lookup::Srv {
                service: "a".into(),
                proto: "tcp".into()
            })
        );
        assert_eq!(
            Lookup::parse(&["x1", "a", "_i"]),
            Some(Lookup::Instance {
                service: "a".into(),
                id: "x1".into()
            })
        );
        assert_eq!(
            Lookup::parse(&["leader", "a"]),
            Some(Lookup::Leader { service: "a".into() })
        );
        assert_eq!(Lookup::parse(&[]), None);
        assert_eq!(Lookup::parse(&["b", "a"]), None);
        assert_eq!(Lookup::parse(&["x", "y", "z", "w"]), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn recursor_addresses() -> Result<(), DiscoverdError> {
        assert_eq!(with_default_port("8.8.8.8"), "8.8.8.8:53");
        assert_eq!(with_default_port("::1"), "[::1]:53");
        assert_eq!(with_default_port("127.0.0.1:5353"), "127.0.0.1:5353");
        assert_eq!(with_default_port("localhost"), "localhost:53");

        let addrs = normalize_recursors(&["127.0.0.1".into(), "::1".into()]).await?;
        assert_eq!(addrs[0], "127.0.0.1:53".parse::<SocketAddr>()?);
        assert_eq!(addrs[1], "[::1]:53".parse::<SocketAddr>()?);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn any_over_udp() -> Result<(), DiscoverdError> {
        let (store, insts) = setup_store().await?;
        let mut server = setup_server(Box::new(store.clone()), DnsConfig::default()).await?;

        let res = query(&server, "a.discoverd.", RecordType::ANY, false).await?;
        assert_eq!(res.response_code(), ResponseCode::NoError);
        assert!(res.authoritative());
        assert_eq!(res.answers().len(), 6);
        assert_eq!(count(res.answers(), RecordType::A), 3);
        assert_eq!(count(res.answers(), RecordType::SRV), 3);
        assert_eq!(srv_targets(res.answers()), expected_targets(&insts));
        assert!(res.additionals().is_empty());

        // names are case-insensitive
        let res = query(&server, "A.DiscoverD.", RecordType::A, false).await?;
        assert_eq!(count(res.answers(), RecordType::A), 3);

        server.shutdown().await?;
        store.close().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn srv_over_tcp() -> Result<(), DiscoverdError> {
        let (store, insts) = setup_store().await?;
        let mut server = setup_server(Box::new(store.clone()), DnsConfig::default()).await?;

        let res = query(&server, "_a._tcp.discoverd.", RecordType::SRV, true).await?;
        assert_eq!(res.answers().len(), 3);
        assert_eq!(count(res.answers(), RecordType::SRV), 3);
        assert_eq!(srv_targets(res.answers()), expected_targets(&insts));
        assert_eq!(res.additionals().len(), 3);
        let extra: BTreeSet<String> = res
            .additionals()
            .iter()
            .map(|r| r.name().to_ascii())
            .collect();
        assert_eq!(extra, expected_targets(&insts));

        // proto filter leaves nothing for udp instances
        let res = query(&server, "_a._udp.discoverd.", RecordType::SRV, true).await?;
        assert_eq!(res.response_code(), ResponseCode::NoError);
        assert!(res.answers().is_empty());
        assert_eq!(count(res.name_servers(), RecordType::SOA), 1);

        server.shutdown().await?;
        store.close().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn udp_truncation_and_dedup() -> Result<(), DiscoverdError> {
        let (store, _) = setup_store().await?;
        for addr in ["192.168.0.4:80", "192.168.0.5:80"] {
            store
                .add_instance("a", &Instance::new(addr, "tcp", BTreeMap::new()))
                .await?;
        }
        // same ip, different proto
        store
            .add_instance("a", &Instance::new("192.168.0.1:80", "udp", BTreeMap::new()))
            .await?;
        let mut server = setup_server(Box::new(store.clone()), DnsConfig::default()).await?;

        let res = query(&server, "a.discoverd.", RecordType::A, false).await?;
        assert_eq!(res.answers().len(), 3);
        let res = query(&server, "a.discoverd.", RecordType::A, true).await?;
        assert_eq!(res.answers().len(), 5);
        let res = query(&server, "a.discoverd.", RecordType::SRV, true).await?;
        assert_eq!(res.answers().len(), 6);
        let res = query(&server, "a.discoverd.", RecordType::AAAA, true).await?;
        assert!(res.answers().is_empty());

        server.shutdown().await?;
        store.close().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn single_instance_lookups() -> Result<(), DiscoverdError> {
        let (store, insts) = setup_store().await?;
        let mut server = setup_server(Box::new(store.clone()), DnsConfig::default()).await?;

        let name = format!("{}.a._i.discoverd.", insts[1].id);
        let res = query(&server, &name, RecordType::A, false).await?;
        assert_eq!(res.answers().len(), 1);
        assert!(matches!(
            res.answers()[0].data(),
            Some(RData::A(a)) if a.0.to_string() == "192.168.0.2"
        ));
        let res = query(&server, &name, RecordType::SRV, true).await?;
        assert_eq!(count(res.answers(), RecordType::SRV), 1);
        assert_eq!(res.additionals().len(), 1);

        // oldest instance leads
        let res = query(&server, "leader.a.discoverd.", RecordType::ANY, false).await?;
        assert_eq!(count(res.answers(), RecordType::A), 1);
        assert_eq!(count(res.answers(), RecordType::SRV), 1);
        assert!(matches!(
            res.answers()[0].data(),
            Some(RData::A(a)) if a.0.to_string() == "192.168.0.1"
        ));

        let res = query(&server, "nope.a._i.discoverd.", RecordType::A, false).await?;
        assert_eq!(res.response_code(), ResponseCode::NXDomain);

        server.shutdown().await?;
        store.close().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn nxdomain_and_soa() -> Result<(), DiscoverdError> {
        let (store, _) = setup_store().await?;
        let mut server = setup_server(Box::new(store.clone()), DnsConfig::default()).await?;

        for name in ["b.discoverd.", "x.y.z.w.discoverd.", "discoverd."] {
            let res = query(&server, name, RecordType::A, false).await?;
            assert_eq!(res.response_code(), ResponseCode::NXDomain);
            assert!(res.answers().is_empty());
            assert_eq!(count(res.name_servers(), RecordType::SOA), 1);
        }

        let res = query(&server, "a.discoverd.", RecordType::SOA, false).await?;
        assert_eq!(res.response_code(), ResponseCode::NoError);
        assert_eq!(res.answers().len(), 1);
        match res.answers()[0].data() {
            Some(RData::SOA(soa)) => {
                assert_eq!(soa.mname().to_ascii(), "ns.discoverd.");
                assert_eq!(soa.rname().to_ascii(), "postmaster.discoverd.");
                assert_eq!(soa.refresh(), 3600);
                assert_eq!(soa.retry(), 600);
                assert_eq!(soa.expire(), 86400);
            }
            other => panic!("unexpected answer {:?}", other),
        }
        assert!(res.name_servers().is_empty());

        server.shutdown().await?;
        store.close().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn recursion_and_servfail() -> Result<(), DiscoverdError> {
        let (store, _) = setup_store().await?;
        let mut upstream = setup_server(
            Box::new(store.clone()),
            DnsConfig::parse(Some("domain = 'upstream.'"))?,
        )
        .await?;

        // no recursors: foreign names fail
        let mut lone = setup_server(Box::new(store.clone()), DnsConfig::default()).await?;
        let res = query(&lone, "a.upstream.", RecordType::A, false).await?;
        assert_eq!(res.response_code(), ResponseCode::ServFail);

        let config = DnsConfig {
            recursors: vec![upstream.udp_addr().to_string()],
            ..Default::default()
        };
        let mut front = setup_server(Box::new(store.clone()), config).await?;
        let res = query(&front, "a.upstream.", RecordType::A, false).await?;
        assert_eq!(res.response_code(), ResponseCode::NoError);
        assert_eq!(res.answers().len(), 3);

        // local names still answered locally, advertising recursion
        let res = query(&front, "a.discoverd.", RecordType::A, false).await?;
        assert!(res.recursion_available());
        assert_eq!(res.answers().len(), 3);

        front.shutdown().await?;
        lone.shutdown().await?;
        upstream.shutdown().await?;
        store.close().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn store_swap() -> Result<(), DiscoverdError> {
        let (store, _) = setup_store().await?;
        let mut server =
            setup_server(Box::new(ProxyStore::new(vec![])), DnsConfig::default()).await?;

        // proxy without peers cannot answer
        let res = query(&server, "a.discoverd.", RecordType::A, false).await?;
        assert_eq!(res.response_code(), ResponseCode::NXDomain);

        server.set_store(Box::new(store.clone()));
        let res = query(&server, "a.discoverd.", RecordType::A, false).await?;
        assert_eq!(res.answers().len(), 3);

        // detached handle swaps back
        let switch = server.store_switch();
        switch.set_store(Box::new(ProxyStore::new(vec![])));
        let res = query(&server, "a.discoverd.", RecordType::A, false).await?;
        assert_eq!(res.response_code(), ResponseCode::NXDomain);

        server.shutdown().await?;
        store.close().await
    }
}
