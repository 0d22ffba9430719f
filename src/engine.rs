use crate::config::Config;
use crate::conn::{Connection, Link};
use crate::monitor::{MonitorPair, TransferMonitor};
use crate::mse::{self, EncryptionTypes, EncryptorFactory, Negotiated};
use crate::netio::{self, NetworkIo, Shaping};
use crate::ratelimit::RateLimiter;
use crate::sched::{self, Priority, Scheduler};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime;

/// Interval between limiter updates.
const LIMITER_UPDATE_PERIOD: Duration = Duration::from_secs(1);

/// Owns the scheduler, the network I/O multiplexer and the engine-wide limiters and monitor.
pub struct Engine {
    config: Config,
    scheduler: Scheduler,
    netio: NetworkIo,
    factory: EncryptorFactory,
    download_limiter: Arc<RateLimiter>,
    upload_limiter: Arc<RateLimiter>,
    monitor: Arc<TransferMonitor>,
}

impl Engine {
    /// Spawn the scheduler workers on `runtime` and start the periodic engine tick.
    /// Must be called within the context of `runtime`.
    pub fn start(config: Config, runtime: runtime::Handle) -> Result<Self, sched::Error> {
        let scheduler = Scheduler::spawn(config.scheduler(), runtime);
        let netio = NetworkIo::new(&scheduler, config.netio())?;
        let factory = EncryptorFactory {
            allowed: config.allowed_encryption,
            prefer_encryption: config.prefer_encryption,
            deadline: config.handshake_timeout(),
        };
        let engine = Self {
            scheduler,
            netio,
            factory,
            download_limiter: Arc::new(RateLimiter::new()),
            upload_limiter: Arc::new(RateLimiter::new()),
            monitor: Arc::new(TransferMonitor::new()),
            config,
        };
        engine.start_tick()?;
        log::info!(
            "Engine started: max download {} B/s, max upload {} B/s, encryption {:?}",
            engine.config.max_download_rate,
            engine.config.max_upload_rate,
            engine.config.allowed_encryption
        );
        Ok(engine)
    }

    fn start_tick(&self) -> Result<(), sched::Error> {
        let tick_period = self.config.engine_tick();
        let ticks_per_update =
            (LIMITER_UPDATE_PERIOD.as_millis() / tick_period.as_millis().max(1)).max(1);
        let max_download_rate = self.config.max_download_rate;
        let max_upload_rate = self.config.max_upload_rate;
        let monitor = self.monitor.clone();
        let download_limiter = self.download_limiter.clone();
        let upload_limiter = self.upload_limiter.clone();
        let mut tick_count = 0u128;

        self.scheduler.submit_recurring(tick_period, Priority::High, move || {
            monitor.tick();
            if tick_count % ticks_per_update == 0 {
                if max_download_rate > 0 {
                    download_limiter.update(max_download_rate, monitor.download_speed());
                }
                if max_upload_rate > 0 {
                    upload_limiter.update(max_upload_rate, monitor.upload_speed());
                }
            }
            tick_count += 1;
            true
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn netio(&self) -> &NetworkIo {
        &self.netio
    }

    /// Engine-wide counters, updated by every transfer shaped with [`Engine::peer_monitors`].
    pub fn monitor(&self) -> &Arc<TransferMonitor> {
        &self.monitor
    }

    pub fn download_limiter(&self) -> &Arc<RateLimiter> {
        &self.download_limiter
    }

    pub fn upload_limiter(&self) -> &Arc<RateLimiter> {
        &self.upload_limiter
    }

    /// Monitors for a new peer, reporting to the engine-wide monitor as well.
    pub fn peer_monitors(&self) -> MonitorPair {
        MonitorPair {
            peer: Arc::new(TransferMonitor::new()),
            manager: self.monitor.clone(),
        }
    }

    /// Shaping of outgoing transfers. Throttled only if a max upload rate is configured.
    pub fn upload_shaping<'a>(&'a self, monitors: Option<&'a MonitorPair>) -> Shaping<'a> {
        Shaping {
            limiter: (self.config.max_upload_rate > 0).then_some(&self.upload_limiter),
            monitors,
        }
    }

    /// Shaping of incoming transfers. Throttled only if a max download rate is configured.
    pub fn download_shaping<'a>(&'a self, monitors: Option<&'a MonitorPair>) -> Shaping<'a> {
        Shaping {
            limiter: (self.config.max_download_rate > 0).then_some(&self.download_limiter),
            monitors,
        }
    }

    /// Connect within the configured timeout.
    pub async fn connect<C: Connection>(&self, link: &Link<C>) -> Result<(), netio::Error> {
        self.netio.connect(link, self.config.connect_timeout()).await
    }

    /// Negotiate encryption of a connection accepted from a remote peer.
    /// Handshakes are never throttled, but counted by `monitors`.
    pub async fn negotiate_inbound<C: Connection>(
        &self,
        link: &Link<C>,
        info_hashes: &[[u8; 20]],
        monitors: Option<&MonitorPair>,
    ) -> Result<Negotiated, mse::Error> {
        let shaping = Shaping {
            limiter: None,
            monitors,
        };
        self.factory.negotiate_inbound(&self.netio, link, shaping, info_hashes).await
    }

    /// Negotiate encryption of a connection to a remote peer.
    pub async fn negotiate_outbound<C: Connection>(
        &self,
        link: &Link<C>,
        info_hash: &[u8; 20],
        peer_supports: EncryptionTypes,
        initial_payload: &[u8],
        monitors: Option<&MonitorPair>,
    ) -> Result<Negotiated, mse::Error> {
        let shaping = Shaping {
            limiter: None,
            monitors,
        };
        let payload = initial_payload;
        self.factory
            .negotiate_outbound(&self.netio, link, shaping, info_hash, peer_supports, payload)
            .await
    }

    /// Number of connect attempts in progress.
    pub fn half_opens(&self) -> usize {
        self.netio.half_opens()
    }

    /// Stop the periodic ticks and wait until all queued work has been executed.
    /// Transfers waiting for limiter budget fail afterwards.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        log::info!("Engine stopped");
    }
}
