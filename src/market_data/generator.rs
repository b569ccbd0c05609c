//! Stochastic order-book activity generator.
//!
//! Each invocation picks a [`MarketMode`], then per tick picks an instrument and either
//! trades against the touch or moves a price level. Every change applied to a book is
//! stamped with the instrument's next rptSeq and fanned out to the registered listeners.

use std::time::Instant;

use ahash::AHashMap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, info, instrument, trace, warn};

use crate::engine::book::PriceLevelBook;
use crate::engine::registry::BookRegistry;
use crate::engine::types::{
    now_nanos, BookError, InstrumentId, LevelChange, Price, Side, Trade, TradingStatus,
};
use crate::market_data::events::{
    BatchEntry, BatchEvent, MarketEvent, MarketEventListener, QuoteUpdate, SnapshotEvent,
    StatisticsEvent, StatusEvent, TradeEvent,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketMode {
    Normal,
    Fast,
    Thin,
    Volatile,
    Trending,
}

/// Multipliers a mode applies on top of the configured base values.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ModeProfile {
    pub volatility: f64,
    pub trade_probability: f64,
    pub quantity: f64,
    /// Mean price movement in standard deviations, signed by the current trend.
    pub drift: f64,
}

impl MarketMode {
    pub const ALL: [MarketMode; 5] = [
        MarketMode::Normal,
        MarketMode::Fast,
        MarketMode::Thin,
        MarketMode::Volatile,
        MarketMode::Trending,
    ];

    pub fn profile(self) -> ModeProfile {
        let (volatility, trade_probability, quantity, drift) = match self {
            MarketMode::Normal => (1.0, 1.0, 1.0, 0.0),
            MarketMode::Fast => (1.5, 2.0, 0.8, 0.0),
            MarketMode::Thin => (1.2, 0.5, 0.3, 0.0),
            MarketMode::Volatile => (3.0, 1.5, 1.2, 0.0),
            MarketMode::Trending => (1.0, 1.2, 1.0, 0.5),
        };
        ModeProfile { volatility, trade_probability, quantity, drift }
    }

    /// Relative frequency when modes are drawn at random.
    fn weight(self) -> u32 {
        match self {
            MarketMode::Normal => 60,
            _ => 10,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeSelection {
    Random,
    Fixed(MarketMode),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Chance a tick trades rather than quotes, before the mode multiplier.
    pub trade_probability: f64,
    /// Standard deviation of a quote move as a fraction of the reference price.
    pub volatility: f64,
    pub min_lot: u64,
    pub max_lot: u64,
    /// Chance a quote tick carries quantity 0, deleting the level it lands on.
    pub delete_probability: f64,
    /// Levels kept per side; the worst level is deleted beyond this.
    pub max_depth: usize,
    pub snapshot_depth: usize,
    pub rpt_seq_base: u32,
    pub mode: ModeSelection,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        GeneratorConfig {
            trade_probability: 0.2,
            volatility: 0.0005,
            min_lot: 1,
            max_lot: 50,
            delete_probability: 0.05,
            max_depth: 10,
            snapshot_depth: 10,
            rpt_seq_base: 1,
            mode: ModeSelection::Random,
        }
    }
}

/// Cumulative for the engine's lifetime.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GeneratorStats {
    pub updates: u64,
    pub trades: u64,
    pub deletes: u64,
    pub skipped: u64,
    pub snapshots: u64,
    pub statistics: u64,
    pub status_changes: u64,
    pub events_dispatched: u64,
    pub mode_counts: [u64; 5],
}

impl GeneratorStats {
    pub fn mode_count(&self, mode: MarketMode) -> u64 {
        self.mode_counts[mode.index()]
    }
}

type TickEntries = SmallVec<[BatchEntry; 4]>;

pub struct GenerationEngine<R: Rng = StdRng> {
    config: GeneratorConfig,
    rng: R,
    listeners: Vec<Box<dyn MarketEventListener>>,
    // last rptSeq handed out, per instrument
    rpt_seqs: AHashMap<InstrumentId, u32>,
    next_trade_id: u32,
    trend_direction: f64,
    last_mode: Option<MarketMode>,
    stats: GeneratorStats,
}

impl GenerationEngine<StdRng> {
    /// Seeds the generator from the wall clock; runs are not reproducible.
    pub fn new(config: GeneratorConfig) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(now_nanos()))
    }
}

impl<R: Rng> GenerationEngine<R> {
    pub fn with_rng(config: GeneratorConfig, rng: R) -> Self {
        GenerationEngine {
            config,
            rng,
            listeners: Vec::new(),
            rpt_seqs: AHashMap::new(),
            next_trade_id: 1,
            trend_direction: 1.0,
            last_mode: None,
            stats: GeneratorStats::default(),
        }
    }

    pub fn add_listener(&mut self, listener: Box<dyn MarketEventListener>) {
        info!(listener = listener.name(), "Registered market event listener");
        self.listeners.push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn stats(&self) -> &GeneratorStats {
        &self.stats
    }

    /// Last rptSeq stamped on an event for `id`, if any.
    pub fn last_rpt_seq(&self, id: InstrumentId) -> Option<u32> {
        self.rpt_seqs.get(&id).copied()
    }

    /// Every instrument's rptSeq restarts at the configured base.
    pub fn reset_sequences(&mut self) {
        self.rpt_seqs.clear();
        info!(base = self.config.rpt_seq_base, "Reset rptSeq counters");
    }

    fn next_rpt_seq(&mut self, id: InstrumentId) -> u32 {
        let base = self.config.rpt_seq_base;
        let seq = match self.rpt_seqs.get(&id) {
            None => base,
            Some(&last) => last.checked_add(1).unwrap_or_else(|| {
                warn!(instrument_id = id, "rptSeq exhausted, wrapping to base");
                base
            }),
        };
        self.rpt_seqs.insert(id, seq);
        seq
    }

    pub fn select_mode(&mut self) -> MarketMode {
        let mode = match self.config.mode {
            ModeSelection::Fixed(mode) => mode,
            ModeSelection::Random => *MarketMode::ALL
                .choose_weighted(&mut self.rng, |m| m.weight())
                .unwrap_or(&MarketMode::Normal),
        };
        if mode == MarketMode::Trending && self.last_mode != Some(MarketMode::Trending) {
            self.trend_direction = if self.rng.gen_bool(0.5) { 1.0 } else { -1.0 };
            debug!(direction = self.trend_direction, "Entering trending mode");
        }
        self.last_mode = Some(mode);
        self.stats.mode_counts[mode.index()] += 1;
        mode
    }

    /// One tick against one uniformly chosen instrument; each resulting change is its own event.
    pub fn generate_update(&mut self, registry: &mut BookRegistry) -> usize {
        let mode = self.select_mode();
        let ids = registry.sorted_ids();
        let Some(&id) = ids.choose(&mut self.rng) else {
            trace!("No instruments registered");
            return 0;
        };
        let entries = self.tick(registry, id, mode, now_nanos());
        let count = entries.len();
        for entry in entries {
            let event = match entry {
                BatchEntry::Quote(q) => MarketEvent::QuoteUpdate(q),
                BatchEntry::Trade(t) => MarketEvent::Trade(t),
            };
            self.dispatch(&event);
        }
        count
    }

    /// `count` ticks against randomly chosen instruments sharing one timestamp, emitted as a
    /// single batch event.
    #[instrument(level = "debug", skip(self, registry))]
    pub fn generate_batch(&mut self, registry: &mut BookRegistry, count: usize) -> usize {
        let mode = self.select_mode();
        let ids = registry.sorted_ids();
        if ids.is_empty() {
            return 0;
        }
        let timestamp = now_nanos();
        let mut entries = Vec::with_capacity(count * 2);
        for _ in 0..count {
            let Some(&id) = ids.choose(&mut self.rng) else { break };
            entries.extend(self.tick(registry, id, mode, timestamp));
        }
        self.emit_batch(timestamp, entries)
    }

    /// One tick per registered instrument, emitted as a single batch event.
    #[instrument(level = "debug", skip_all)]
    pub fn generate_all_instruments(&mut self, registry: &mut BookRegistry) -> usize {
        let mode = self.select_mode();
        let timestamp = now_nanos();
        let mut entries = Vec::with_capacity(registry.len() * 2);
        for id in registry.sorted_ids() {
            entries.extend(self.tick(registry, id, mode, timestamp));
        }
        self.emit_batch(timestamp, entries)
    }

    fn emit_batch(&mut self, timestamp: u64, entries: Vec<BatchEntry>) -> usize {
        let count = entries.len();
        if count > 0 {
            self.dispatch(&MarketEvent::Batch(BatchEvent { timestamp, entries }));
        }
        count
    }

    /// Emits the current depth, stats and status of `id`. Does not consume an rptSeq.
    pub fn generate_snapshot(&mut self, registry: &BookRegistry, id: InstrumentId) -> Result<(), BookError> {
        let book = registry.lookup(id)?;
        let depth = self.config.snapshot_depth;
        let event = SnapshotEvent {
            instrument_id: id,
            rpt_seq: self.last_rpt_seq(id).unwrap_or(0),
            timestamp: now_nanos(),
            bids: book.bid_depth(depth),
            asks: book.ask_depth(depth),
            stats: *book.stats(),
            status: book.trading_status(),
        };
        self.stats.snapshots += 1;
        self.dispatch(&MarketEvent::Snapshot(event));
        Ok(())
    }

    pub fn generate_statistics(&mut self, registry: &BookRegistry, id: InstrumentId) -> Result<(), BookError> {
        let stats = *registry.lookup(id)?.stats();
        let event = StatisticsEvent {
            instrument_id: id,
            rpt_seq: self.next_rpt_seq(id),
            timestamp: now_nanos(),
            stats,
        };
        self.stats.statistics += 1;
        self.dispatch(&MarketEvent::Statistics(event));
        Ok(())
    }

    pub fn set_trading_status(
        &mut self,
        registry: &mut BookRegistry,
        id: InstrumentId,
        status: TradingStatus,
    ) -> Result<(), BookError> {
        registry.lookup_mut(id)?.set_trading_status(status);
        let event = StatusEvent {
            instrument_id: id,
            rpt_seq: self.next_rpt_seq(id),
            timestamp: now_nanos(),
            status,
        };
        info!(instrument_id = id, ?status, "Trading status changed");
        self.stats.status_changes += 1;
        self.dispatch(&MarketEvent::StatusChange(event));
        Ok(())
    }

    pub fn poll_listeners(&mut self, registry: &BookRegistry, now: Instant) {
        for listener in &mut self.listeners {
            listener.poll(registry, now);
        }
    }

    pub fn shutdown_listeners(&mut self) {
        for listener in &mut self.listeners {
            listener.shutdown();
        }
    }

    fn dispatch(&mut self, event: &MarketEvent) {
        trace!(kind = event.kind(), listeners = self.listeners.len(), "Dispatching event");
        for listener in &mut self.listeners {
            listener.on_market_event(event);
        }
        self.stats.events_dispatched += 1;
        metrics::counter!("mdfeed_generator_events_total").increment(1);
    }

    fn tick(&mut self, registry: &mut BookRegistry, id: InstrumentId, mode: MarketMode, ts: u64) -> TickEntries {
        let book = match registry.lookup_mut(id) {
            Ok(book) => book,
            Err(error) => {
                warn!(instrument_id = id, %error, "Skipping tick");
                return TickEntries::new();
            }
        };
        let profile = mode.profile();
        let trade_probability = (self.config.trade_probability * profile.trade_probability).clamp(0.0, 1.0);

        let mut entries = TickEntries::new();
        if self.rng.gen::<f64>() < trade_probability {
            self.trade(book, profile, ts, &mut entries);
        }
        if entries.is_empty() {
            self.quote(book, profile, ts, &mut entries);
        }
        if entries.is_empty() {
            self.stats.skipped += 1;
        }
        entries
    }

    fn draw_lot(&mut self, profile: ModeProfile) -> u64 {
        let min = self.config.min_lot.max(1);
        let max = self.config.max_lot.max(min);
        let base = self.rng.gen_range(min..=max);
        ((base as f64 * profile.quantity).round() as u64).max(1)
    }

    /// Trades a random lot at the touch, then reduces (or removes) the touched level.
    fn trade(&mut self, book: &mut PriceLevelBook, profile: ModeProfile, ts: u64, entries: &mut TickEntries) {
        let aggressor = if self.rng.gen_bool(0.5) { Side::Buy } else { Side::Sell };
        let resting = aggressor.opposite();
        let Some(level) = book.best_level(resting).copied() else {
            trace!(instrument_id = book.instrument().id, ?resting, "No resting liquidity to trade against");
            return;
        };
        let id = book.instrument().id;
        let quantity = self.draw_lot(profile);

        book.record_trade(Trade { price: level.price, quantity, timestamp: ts, aggressor });
        let trade_id = self.next_trade_id;
        self.next_trade_id = self.next_trade_id.wrapping_add(1).max(1);
        entries.push(BatchEntry::Trade(TradeEvent {
            instrument_id: id,
            rpt_seq: self.next_rpt_seq(id),
            timestamp: ts,
            trade_id,
            price: level.price,
            quantity,
            aggressor,
        }));
        self.stats.trades += 1;
        metrics::counter!("mdfeed_generator_trades_total").increment(1);

        let remaining = level.quantity.saturating_sub(quantity);
        self.apply_level(book, resting, level.price, remaining, ts, entries);
    }

    /// Moves the touched side's best price by a normal draw and rests a lot there.
    fn quote(&mut self, book: &mut PriceLevelBook, profile: ModeProfile, ts: u64, entries: &mut TickEntries) {
        let side = if self.rng.gen_bool(0.5) { Side::Buy } else { Side::Sell };
        let tick = book.instrument().tick_size;
        let Some(reference) = reference_price(book, side) else {
            trace!(instrument_id = book.instrument().id, "No reference price, skipping quote");
            return;
        };

        let z: f64 = StandardNormal.sample(&mut self.rng);
        let sigma = self.config.volatility * profile.volatility * reference.to_f64();
        let movement = (z + profile.drift * self.trend_direction) * sigma;
        let mut price = Price::from_f64(reference.to_f64() + movement).round_to_tick(tick);

        // Quotes never cross the opposite touch.
        match side {
            Side::Buy => {
                if let Some(ask) = book.best_ask() {
                    if price >= ask {
                        price = ask - tick;
                    }
                }
            }
            Side::Sell => {
                if let Some(bid) = book.best_bid() {
                    if price <= bid {
                        price = bid + tick;
                    }
                }
            }
        }
        if price.mantissa() <= 0 {
            price = tick;
        }
        // The one-tick floor can land back on the touch when the book sits at the minimum price.
        let crosses = match side {
            Side::Buy => book.best_ask().is_some_and(|ask| price >= ask),
            Side::Sell => book.best_bid().is_some_and(|bid| price <= bid),
        };
        if crosses {
            trace!(instrument_id = book.instrument().id, ?side, %price, "No room inside the touch, skipping quote");
            return;
        }

        let quantity = if self.rng.gen::<f64>() < self.config.delete_probability {
            0
        } else {
            self.draw_lot(profile)
        };
        self.apply_level(book, side, price, quantity, ts, entries);
        self.trim_depth(book, side, ts, entries);
    }

    fn apply_level(
        &mut self,
        book: &mut PriceLevelBook,
        side: Side,
        price: Price,
        quantity: u64,
        ts: u64,
        entries: &mut TickEntries,
    ) {
        let id = book.instrument().id;
        let position_before = book.level_position(side, price);
        let Some(action) = book.upsert(side, price, quantity, ts) else {
            return;
        };
        let (position, order_count) = match action {
            LevelChange::Delete => {
                self.stats.deletes += 1;
                (position_before.unwrap_or(1), 0)
            }
            LevelChange::New | LevelChange::Change => {
                let position = book.level_position(side, price).unwrap_or(1);
                let orders = book.level(side, price).map_or(0, |l| l.order_count);
                (position, orders)
            }
        };
        entries.push(BatchEntry::Quote(QuoteUpdate {
            instrument_id: id,
            rpt_seq: self.next_rpt_seq(id),
            timestamp: ts,
            side,
            action,
            price,
            quantity,
            order_count,
            level: position.min(u8::MAX as usize) as u8,
        }));
        self.stats.updates += 1;
        metrics::counter!("mdfeed_generator_updates_total").increment(1);
    }

    fn trim_depth(&mut self, book: &mut PriceLevelBook, side: Side, ts: u64, entries: &mut TickEntries) {
        let max_depth = self.config.max_depth.max(1);
        while book.level_count(side) > max_depth {
            let Some(worst) = book.depth(side, usize::MAX).last().map(|l| l.price) else {
                break;
            };
            self.apply_level(book, side, worst, 0, ts, entries);
        }
    }
}

/// Touch price of `side`, or one tick away from the opposite touch, or the last/settlement price.
fn reference_price(book: &PriceLevelBook, side: Side) -> Option<Price> {
    if let Some(price) = book.best_price(side) {
        return Some(price);
    }
    let tick = book.instrument().tick_size;
    match side {
        Side::Buy => book.best_ask().map(|ask| ask - tick),
        Side::Sell => book.best_bid().map(|bid| bid + tick),
    }
    .or(book.stats().last)
    .or(book.stats().settlement)
}
