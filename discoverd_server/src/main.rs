//! Discoverd registry peer process.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use discoverd::model::split_host_port;
use discoverd::server::{
    Backend, DnsConfig, DnsServer, ExternalApi, HttpHandler, MemCluster,
    Membership, ProxyStore, StoreConfig,
};
use discoverd::{logger_init, pf_error, pf_info, pf_warn, DiscoverdError, ME};
use log::{self, LevelFilter};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Local IP to use for binding the listening sockets.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Host other peers and clients reach this peer at.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// HTTP API port.
    #[arg(short = 'p', long, default_value_t = 1111)]
    http_port: u16,

    /// DNS port served over both UDP and TCP; DNS is off if not given.
    #[arg(short, long)]
    dns_port: Option<u16>,

    /// Comma-separated peer HTTP addresses. If this peer's advertised
    /// address is not among them, it serves as a proxy to them until
    /// promoted through `POST /raft/promote`.
    #[arg(long, value_delimiter = ',')]
    peers: Vec<String>,

    /// Comma-separated DNS recursors; overrides those in `dns_config`.
    #[arg(long, value_delimiter = ',')]
    recursors: Vec<String>,

    /// Store config in TOML format.
    #[arg(long, default_value = "")]
    config: String,

    /// DNS config in TOML format.
    #[arg(long, default_value = "")]
    dns_config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

/// Role this process takes in the cluster.
#[derive(Debug, PartialEq, Eq)]
enum PeerMode {
    /// Runs the registry locally.
    Member,

    /// Forwards everything to the given peers.
    Proxy(Vec<String>),
}

impl CliArgs {
    /// Address advertised to peers and used as the logging prefix.
    fn advertise_addr(&self) -> String {
        format!("{}:{}", self.host, self.http_port)
    }

    /// Sanitize command line arguments, return `Ok(mode)` on success or
    /// `Err(DiscoverdError)` on any error.
    fn sanitize(&self) -> Result<PeerMode, DiscoverdError> {
        if self.http_port == 0 {
            return Err(DiscoverdError::msg(format!(
                "invalid http_port {}",
                self.http_port
            )));
        }
        if let Some(dns_port) = self.dns_port {
            if dns_port == 0 {
                return Err(DiscoverdError::msg(format!(
                    "invalid dns_port {}",
                    dns_port
                )));
            } else if dns_port == self.http_port {
                return Err(DiscoverdError::msg(format!(
                    "dns_port == http_port {}",
                    dns_port
                )));
            }
        }
        if self.host.is_empty() {
            return Err(DiscoverdError::msg("empty advertised host"));
        }
        if self.threads < 2 {
            return Err(DiscoverdError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }
        for peer in &self.peers {
            split_host_port(peer)?;
        }

        let advertise = self.advertise_addr();
        if self.peers.is_empty() || self.peers == [advertise.clone()] {
            Ok(PeerMode::Member)
        } else if self.peers.contains(&advertise) {
            Err(DiscoverdError::msg(format!(
                "cannot join {} as member: the in-process log holds a single peer",
                self.peers.join(",")
            )))
        } else {
            Ok(PeerMode::Proxy(self.peers.clone()))
        }
    }

    /// Parses the store and DNS config strings.
    fn parse_configs(&self) -> Result<(StoreConfig, DnsConfig), DiscoverdError> {
        let store_config = StoreConfig::parse(Some(self.config.as_str()))?;
        let mut dns_config = DnsConfig::parse(Some(self.dns_config.as_str()))?;
        if !self.recursors.is_empty() {
            dns_config.recursors = self.recursors.clone();
        }
        Ok((store_config, dns_config))
    }
}

/// Actual main function of the discoverd peer.
fn server_main() -> Result<(), DiscoverdError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let mode = args.sanitize()?;
    let (store_config, dns_config) = args.parse_configs()?;

    let advertise = args.advertise_addr();
    let _ = ME.set(advertise.clone());

    // parse HTTP API address
    let http_addr: SocketAddr = format!("{}:{}", args.bind_ip, args.http_port)
        .parse()
        .map_err(|e| {
            DiscoverdError::msg(format!(
                "failed to parse http_addr: bind_ip {} port {}: {}",
                args.bind_ip, args.http_port, e
            ))
        })?;

    // parse DNS address if enabled
    let dns_addr: Option<SocketAddr> = match args.dns_port {
        Some(port) => Some(
            format!("{}:{}", args.bind_ip, port).parse().map_err(|e| {
                DiscoverdError::msg(format!(
                    "failed to parse dns_addr: bind_ip {} port {}: {}",
                    args.bind_ip, port, e
                ))
            })?,
        ),
        None => None,
    };

    // set up termination signals handler
    let (tx_term, mut rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })
    .map_err(DiscoverdError::msg)?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-discoverd")
            .build()?;

        // enter tokio runtime, take up the initial role, start the HTTP
        // and DNS listeners, and wait for termination
        runtime.block_on(async move {
            let handler = HttpHandler::new(Backend::Proxy(vec![]));
            let membership = Membership::new(
                MemCluster::new(),
                &advertise,
                store_config,
                args.peers.clone(),
            );
            handler.set_membership(membership.clone())?;

            let mut dns = match dns_addr {
                Some(addr) => {
                    let placeholder = Box::new(ProxyStore::new(vec![]));
                    let dns =
                        DnsServer::setup(addr, addr, dns_config, placeholder)
                            .await?;
                    membership.attach_dns(dns.store_switch());
                    Some(dns)
                }
                None => None,
            };

            match mode {
                PeerMode::Member => {
                    membership.promote(&handler).await?;
                }
                PeerMode::Proxy(peers) => {
                    pf_warn!(
                        "advertised address not in peer set, proxying to {}",
                        peers.join(",")
                    );
                    membership.demote(&handler).await?;
                }
            }

            let mut api = ExternalApi::setup(http_addr, handler).await?;
            pf_info!("listening for HTTP on {}", api.local_addr());

            rx_term.changed().await?;
            pf_warn!("received termination signal");

            api.shutdown().await?;
            if let Some(dns) = dns.as_mut() {
                dns.shutdown().await?;
            }
            membership.shutdown().await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), DiscoverdError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the discoverd peer.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = server_main() {
        pf_error!("server_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
