//! Wires the book registry, the generation engine and the enabled feeds together and
//! drives them from a single-threaded timer loop.

use std::time::Duration;

use anyhow::Context;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::cme::CmeFeed;
use crate::config::FeedConfig;
use crate::engine::registry::BookRegistry;
use crate::engine::types::TradingStatus;
use crate::market_data::events::MarketEventListener;
use crate::market_data::generator::{GenerationEngine, GeneratorStats};
use crate::reuters::{CredentialStore, SessionServer};
use crate::transport::{TcpAcceptor, UdpSink};

pub struct FeedService {
    config: FeedConfig,
    registry: BookRegistry,
    engine: GenerationEngine,
}

impl FeedService {
    /// Registers every configured instrument; no feeds are attached yet.
    pub fn new(config: FeedConfig) -> anyhow::Result<Self> {
        let mut registry = BookRegistry::new();
        for inst in &config.instruments {
            registry
                .register(inst.instrument(), inst.initial_price(), inst.initial_spread())
                .with_context(|| format!("registering {}", inst.symbol))?;
        }
        let engine = GenerationEngine::new(config.generator.clone());
        Ok(FeedService { config, registry, engine })
    }

    /// [`FeedService::new`] plus the CME multicast and Reuters TCP feeds that are enabled.
    pub async fn build(config: FeedConfig) -> anyhow::Result<Self> {
        let mut service = Self::new(config)?;
        let cme = &service.config.cme;
        if cme.enabled {
            let incremental = UdpSink::bind(cme.bind, cme.incremental, cme.multicast_ttl)
                .await
                .with_context(|| format!("binding incremental sink for {}", cme.incremental))?;
            let snapshot = UdpSink::bind(cme.bind, cme.snapshot, cme.multicast_ttl)
                .await
                .with_context(|| format!("binding snapshot sink for {}", cme.snapshot))?;
            let feed = CmeFeed::new(incremental, snapshot, cme.batcher(), cme.batcher());
            service.engine.add_listener(Box::new(feed));
        }

        let reuters = &service.config.reuters;
        if reuters.enabled {
            let acceptor = TcpAcceptor::bind(reuters.listen)
                .await
                .with_context(|| format!("listening on {}", reuters.listen))?;
            let server = SessionServer::new(
                acceptor,
                reuters.server(service.config.generator.snapshot_depth),
                CredentialStore::new(reuters.credentials.iter().cloned()),
            );
            service.engine.add_listener(Box::new(server));
        }
        Ok(service)
    }

    pub fn add_listener(&mut self, listener: Box<dyn MarketEventListener>) {
        self.engine.add_listener(listener);
    }

    pub fn registry(&self) -> &BookRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &GeneratorStats {
        self.engine.stats()
    }

    pub fn tick(&mut self) -> usize {
        self.engine.generate_batch(&mut self.registry, self.config.schedule.updates_per_tick)
    }

    pub fn poll(&mut self) {
        self.engine.poll_listeners(&self.registry, std::time::Instant::now());
    }

    pub fn publish_snapshots(&mut self) {
        for id in self.registry.sorted_ids() {
            if let Err(e) = self.engine.generate_snapshot(&self.registry, id) {
                warn!(instrument_id = id, error = %e, "Snapshot skipped");
            }
        }
    }

    pub fn publish_statistics(&mut self) {
        for id in self.registry.sorted_ids() {
            if let Err(e) = self.engine.generate_statistics(&self.registry, id) {
                warn!(instrument_id = id, error = %e, "Statistics skipped");
            }
        }
    }

    pub fn set_status_all(&mut self, status: TradingStatus) {
        for id in self.registry.sorted_ids() {
            if let Err(e) = self.engine.set_trading_status(&mut self.registry, id, status) {
                warn!(instrument_id = id, error = %e, "Status change skipped");
            }
        }
    }

    /// Lets every listener see the registry once, then opens all instruments.
    pub fn open_market(&mut self) {
        self.poll();
        self.set_status_all(TradingStatus::Open);
    }

    /// Runs until Ctrl-C or until `limit` elapses, then closes the market and shuts the
    /// feeds down.
    pub async fn run(mut self, limit: Option<Duration>) -> anyhow::Result<GeneratorStats> {
        let schedule = self.config.schedule.clone();
        let mut ticks = interval(schedule.tick_interval_ms);
        let mut polls = interval(schedule.poll_interval_ms);
        let mut snapshots = interval(schedule.snapshot_interval_ms);
        let mut statistics = interval(schedule.statistics_interval_ms);

        let deadline = limit.map(|d| Instant::now() + d);
        let expired = async move {
            match deadline {
                Some(at) => time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(expired);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        info!(instruments = self.registry.len(), ?limit, "Feed running");
        self.open_market();

        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    self.tick();
                }
                _ = polls.tick() => self.poll(),
                _ = snapshots.tick() => self.publish_snapshots(),
                _ = statistics.tick() => self.publish_statistics(),
                res = &mut ctrl_c => {
                    if let Err(e) = res {
                        warn!(error = %e, "Ctrl-C handler failed");
                    }
                    info!("Interrupted");
                    break;
                }
                _ = &mut expired => {
                    info!("Run duration elapsed");
                    break;
                }
            }
        }

        self.shutdown();
        Ok(self.engine.stats().clone())
    }

    pub fn shutdown(&mut self) {
        self.set_status_all(TradingStatus::Close);
        self.poll();
        self.engine.shutdown_listeners();
        let stats = self.engine.stats();
        info!(
            updates = stats.updates,
            trades = stats.trades,
            snapshots = stats.snapshots,
            events = stats.events_dispatched,
            "Feed stopped"
        );
    }
}

fn interval(ms: u64) -> time::Interval {
    let mut interval = time::interval(Duration::from_millis(ms));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}
