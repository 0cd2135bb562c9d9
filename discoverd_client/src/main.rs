//! Discoverd registry command line client.

use std::collections::BTreeMap;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use discoverd::client::{Client, HeartbeatConfig, Heartbeater};
use discoverd::model::{valid_service_name, ServiceConfig, ServiceMeta};
use discoverd::{logger_init, pf_error, pf_info, pf_warn, DiscoverdError, ME};
use log::{self, LevelFilter};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Discoverd HTTP URL; falls back to `DISCOVERD` or the local default.
    #[arg(short, long)]
    url: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,

    #[command(subcommand)]
    action: Action,
}

/// Operations on the registry.
#[derive(Subcommand, Debug)]
enum Action {
    /// Create a service.
    AddService {
        service: String,

        /// Leader set explicitly rather than elected by age.
        #[arg(long)]
        manual: bool,
    },

    /// Delete a service with all its instances.
    RemoveService { service: String },

    /// Register an instance and heartbeat it until interrupted.
    Register {
        service: String,

        /// Instance address; `:port` is expanded with `EXTERNAL_IP`.
        addr: String,

        #[arg(long, default_value = "tcp")]
        proto: String,

        /// Comma-separated `key=value` metadata.
        #[arg(long, value_delimiter = ',')]
        meta: Vec<String>,

        /// Heartbeater config in TOML format.
        #[arg(long, default_value = "")]
        config: String,
    },

    /// List instances of a service.
    Instances {
        service: String,

        /// Wait this long for a first instance if there are none.
        #[arg(long)]
        wait_ms: Option<u64>,
    },

    /// Print events of a service until interrupted.
    Watch { service: String },

    /// Show or set the leader of a service.
    Leader {
        service: String,

        /// Instance id to install as leader.
        #[arg(long)]
        set: Option<String>,
    },

    /// Show or compare-and-set the metadata of a service.
    Meta {
        service: String,

        /// JSON document to write.
        #[arg(long)]
        set: Option<String>,

        /// Expected current index; 0 creates.
        #[arg(long, default_value_t = 0)]
        index: u64,
    },

    /// List the cluster peers and the current leader.
    Peers,
}

impl Action {
    fn service(&self) -> Option<&str> {
        match self {
            Action::AddService { service, .. }
            | Action::RemoveService { service }
            | Action::Register { service, .. }
            | Action::Instances { service, .. }
            | Action::Watch { service }
            | Action::Leader { service, .. }
            | Action::Meta { service, .. } => Some(service.as_str()),
            Action::Peers => None,
        }
    }
}

/// Parses `key=value` pairs.
fn parse_meta(pairs: &[String]) -> Result<BTreeMap<String, String>, DiscoverdError> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) if !k.is_empty() => Ok((k.into(), v.into())),
            _ => Err(DiscoverdError::msg(format!("invalid meta pair '{}'", pair))),
        })
        .collect()
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(DiscoverdError)` on any error.
    fn sanitize(&self) -> Result<(), DiscoverdError> {
        if self.threads < 1 {
            return Err(DiscoverdError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }
        if let Some(service) = self.action.service() {
            valid_service_name(service)?;
        }
        match &self.action {
            Action::Register { meta, config, .. } => {
                parse_meta(meta)?;
                HeartbeatConfig::parse(Some(config.as_str()))?;
            }
            Action::Meta { set: Some(data), .. } => {
                serde_json::from_str::<serde_json::Value>(data)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn client(&self) -> Result<Client, DiscoverdError> {
        match &self.url {
            Some(url) => Client::with_url(url),
            None => Client::new(),
        }
    }
}

/// Prints a value as one line of JSON.
fn print_json(value: &impl serde::Serialize) -> Result<(), DiscoverdError> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

/// Runs one action against the registry.
async fn run_action(
    client: Client,
    action: Action,
    mut rx_term: watch::Receiver<bool>,
) -> Result<(), DiscoverdError> {
    match action {
        Action::AddService { service, manual } => {
            let config = if manual {
                ServiceConfig::manual()
            } else {
                ServiceConfig::default()
            };
            client.add_service(&service, config).await?;
            pf_info!("created service {}", service);
        }

        Action::RemoveService { service } => {
            client.remove_service(&service).await?;
            pf_info!("removed service {}", service);
        }

        Action::Register {
            service,
            addr,
            proto,
            meta,
            config,
        } => {
            let meta = parse_meta(&meta)?;
            let config = HeartbeatConfig::parse(Some(config.as_str()))?;
            let hb =
                Heartbeater::register(client, &service, &addr, &proto, meta, config)
                    .await?;
            print_json(&hb.instance())?;

            rx_term.changed().await?;
            pf_warn!("received termination signal");
            hb.close().await?;
        }

        Action::Instances { service, wait_ms } => {
            let list = match wait_ms {
                Some(ms) => {
                    client
                        .wait_instances(&service, Duration::from_millis(ms))
                        .await?
                }
                None => client.instances(&service).await?,
            };
            for inst in &list {
                print_json(inst)?;
            }
        }

        Action::Watch { service } => {
            let mut watch = client.watch(&service).await?;
            loop {
                tokio::select! {
                    event = watch.recv() => match event {
                        Some(event) => print_json(&event)?,
                        None => break,
                    },
                    _ = rx_term.changed() => {
                        pf_warn!("received termination signal");
                        break;
                    }
                }
            }
            let err = watch.err();
            watch.close().await?;
            if let Some(e) = err {
                return Err(e);
            }
        }

        Action::Leader { service, set } => match set {
            Some(id) => {
                client.set_leader(&service, &id).await?;
                pf_info!("set leader of {} to {}", service, id);
            }
            None => match client.leader(&service).await? {
                Some(leader) => print_json(&leader)?,
                None => pf_warn!("service {} has no leader", service),
            },
        },

        Action::Meta {
            service,
            set,
            index,
        } => match set {
            Some(data) => {
                let mut meta = ServiceMeta::new(serde_json::from_str(&data)?, index);
                client.set_meta(&service, &mut meta).await?;
                print_json(&meta)?;
            }
            None => match client.get_meta(&service).await? {
                Some(meta) => print_json(&meta)?,
                None => pf_warn!("service {} has no metadata", service),
            },
        },

        Action::Peers => {
            let leader = client.raft_leader().await?;
            for peer in client.raft_peers().await? {
                if peer == leader {
                    println!("{} (leader)", peer);
                } else {
                    println!("{}", peer);
                }
            }
        }
    }
    Ok(())
}

/// Actual main function of the discoverd client.
fn client_main() -> Result<(), DiscoverdError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;
    let client = args.client()?;
    let _ = ME.set("client".into());

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
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
            .thread_name("tokio-worker-client")
            .build()?;

        // enter tokio runtime and run the requested action
        runtime.block_on(async move {
            run_action(client, args.action, rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), DiscoverdError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the discoverd client.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = client_main() {
        pf_error!("client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
