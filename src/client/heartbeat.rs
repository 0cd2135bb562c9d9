//! Client-side registration that keeps an instance alive by re-registering
//! it periodically.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::client::Client;
use crate::model::Instance;
use crate::utils::{Attempts, DiscoverdError, Timer};

use arc_swap::ArcSwap;

use parking_lot::Mutex;

use rand::Rng;

use serde::{Deserialize, Serialize};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Environment variables copied into instance metadata by default.
pub const DEFAULT_META_ENV: [&str; 4] = [
    "FLYNN_APP_ID",
    "FLYNN_RELEASE_ID",
    "FLYNN_PROCESS_TYPE",
    "FLYNN_JOB_ID",
];

/// Heartbeater tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Steady-state period between heartbeats.
    pub interval_ms: u64,

    /// Up to this much is subtracted from each steady-state period.
    pub jitter_ms: u64,

    /// Base delay between retries after a failed heartbeat.
    pub fast_retry_ms: u64,

    /// Up to this much is added to each retry delay.
    pub fast_jitter_ms: u64,

    /// Environment variables copied into the metadata of new registrations.
    pub meta_env: Vec<String>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            interval_ms: 5_000,
            jitter_ms: 2_000,
            fast_retry_ms: 200,
            fast_jitter_ms: 200,
            meta_env: DEFAULT_META_ENV.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl HeartbeatConfig {
    /// Overlays fields from a TOML string onto the defaults.
    pub fn parse(config_str: Option<&str>) -> Result<Self, DiscoverdError> {
        let config = parsed_config!(config_str => HeartbeatConfig;
                                    interval_ms, jitter_ms,
                                    fast_retry_ms, fast_jitter_ms, meta_env)?;
        if config.interval_ms == 0 || config.jitter_ms >= config.interval_ms {
            return Err(DiscoverdError::Validation(
                "heartbeat interval must be positive and exceed its jitter".into(),
            ));
        }
        Ok(config)
    }

    fn steady_delay(&self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0..=self.jitter_ms);
        Duration::from_millis(self.interval_ms.saturating_sub(jitter).max(1))
    }

    fn fast_delay(&self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0..=self.fast_jitter_ms);
        Duration::from_millis((self.fast_retry_ms + jitter).max(1))
    }
}

/// Expands an address starting with `:` to `<external_ip>:<port>`.
pub fn expand_addr(addr: &str, external_ip: Option<&str>) -> String {
    match external_ip {
        Some(ip) if addr.starts_with(':') => format!("{}{}", ip, addr),
        _ => addr.into(),
    }
}

/// Collects the set environment variables among `keys`.
pub fn env_meta(keys: &[String]) -> BTreeMap<String, String> {
    keys.iter()
        .filter_map(|k| match std::env::var(k) {
            Ok(v) if !v.is_empty() => Some((k.clone(), v)),
            _ => None,
        })
        .collect()
}

/// Handle of a registered instance. The instance stays registered until
/// `close()`; dropping the handle stops heartbeating without deregistering.
pub struct Heartbeater {
    /// Service registered under.
    service: String,

    /// Instance as last sent.
    inst: Arc<Mutex<Instance>>,

    /// Client used by the heartbeat loop; swappable at runtime.
    client: Arc<ArcSwap<Client>>,

    /// Sender side of the termination channel.
    tx_term: watch::Sender<bool>,

    /// Join handle of the heartbeat loop, taken on close.
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Heartbeater {
    /// Registers `addr` with `proto` under `service`. An address like `:80`
    /// is expanded with `EXTERNAL_IP`, and the configured environment
    /// variables are merged into `meta`.
    pub async fn register(
        client: Client,
        service: &str,
        addr: &str,
        proto: &str,
        meta: BTreeMap<String, String>,
        config: HeartbeatConfig,
    ) -> Result<Self, DiscoverdError> {
        let external_ip = std::env::var("EXTERNAL_IP").ok();
        let addr = expand_addr(addr, external_ip.as_deref());
        let mut full_meta = env_meta(&config.meta_env);
        full_meta.extend(meta);
        let inst = Instance::new(addr, proto, full_meta);
        Self::register_instance(client, service, inst, config).await
    }

    /// Registers a fully formed instance and starts heartbeating it.
    pub async fn register_instance(
        client: Client,
        service: &str,
        inst: Instance,
        config: HeartbeatConfig,
    ) -> Result<Self, DiscoverdError> {
        inst.valid()?;
        Attempts::REGISTER
            .run(
                || client.add_instance(service, &inst),
                |e| !e.is_validation(),
            )
            .await?;
        pf_info!("registered {} as {} in {}", inst.addr, inst.id, service);

        let inst = Arc::new(Mutex::new(inst));
        let client = Arc::new(ArcSwap::from_pointee(client));
        let (tx_term, rx_term) = watch::channel(false);
        let handle = tokio::spawn(Self::heartbeat_task(
            service.into(),
            inst.clone(),
            client.clone(),
            config,
            rx_term,
        ));

        Ok(Heartbeater {
            service: service.into(),
            inst,
            client,
            tx_term,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Snapshot of the registered instance.
    pub fn instance(&self) -> Instance {
        self.inst.lock().clone()
    }

    pub fn addr(&self) -> String {
        self.inst.lock().addr.clone()
    }

    /// Points subsequent heartbeats at another client.
    pub fn set_client(&self, client: Client) {
        self.client.store(Arc::new(client));
    }

    /// Replaces the instance metadata and pushes it right away.
    pub async fn set_meta(
        &self,
        meta: BTreeMap<String, String>,
    ) -> Result<(), DiscoverdError> {
        let inst = {
            let mut inst = self.inst.lock();
            inst.meta = meta;
            inst.clone()
        };
        self.client.load_full().add_instance(&self.service, &inst).await
    }

    /// Stops heartbeating and deregisters, best-effort. Only the first call
    /// does anything.
    pub async fn close(&self) -> Result<(), DiscoverdError> {
        let Some(handle) = self.handle.lock().take() else {
            return Ok(());
        };
        self.tx_term.send_replace(true);
        handle.await?;

        let id = self.inst.lock().id.clone();
        if let Err(e) = self
            .client
            .load_full()
            .remove_instance(&self.service, &id)
            .await
        {
            pf_warn!("error deregistering {} from {}: {}", id, self.service, e);
        }
        Ok(())
    }

    async fn heartbeat_task(
        service: String,
        inst: Arc<Mutex<Instance>>,
        client: Arc<ArcSwap<Client>>,
        config: HeartbeatConfig,
        mut rx_term: watch::Receiver<bool>,
    ) {
        pf_debug!("heartbeat task for {} spawned", service);
        let mut timer = Timer::new();
        let mut failing = false;
        if let Err(e) = timer.restart(config.steady_delay()) {
            pf_error!("error arming heartbeat timer: {}", e);
            return;
        }

        loop {
            tokio::select! {
                _ = timer.timeout() => {
                    let current = inst.lock().clone();
                    let delay = match client.load_full().add_instance(&service, &current).await {
                        Ok(()) => {
                            if failing {
                                pf_info!("heartbeat for {} recovered", current.id);
                                failing = false;
                            }
                            config.steady_delay()
                        }
                        Err(e) => {
                            pf_warn!("heartbeat for {} failed: {}", current.id, e);
                            failing = true;
                            config.fast_delay()
                        }
                    };
                    if let Err(e) = timer.restart(delay) {
                        pf_error!("error re-arming heartbeat timer: {}", e);
                        break;
                    }
                },

                _ = rx_term.changed() => break,
            }
        }
        pf_debug!("heartbeat task for {} exited", service);
    }
}

impl Drop for Heartbeater {
    fn drop(&mut self) {
        self.tx_term.send_replace(true);
    }
}
