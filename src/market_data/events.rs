// Protocol-neutral market events and the listener seam protocol adapters implement.

use std::time::Instant;

use crate::engine::registry::BookRegistry;
use crate::engine::types::{
    InstrumentId, LevelChange, MarketStats, Price, PriceLevel, Side, TradingStatus,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuoteUpdate {
    pub instrument_id: InstrumentId,
    pub rpt_seq: u32,
    pub timestamp: u64,
    pub side: Side,
    pub action: LevelChange,
    pub price: Price,
    /// Zero when `action` is `Delete`.
    pub quantity: u64,
    pub order_count: u32,
    /// 1-based depth position the change applies to.
    pub level: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TradeEvent {
    pub instrument_id: InstrumentId,
    pub rpt_seq: u32,
    pub timestamp: u64,
    pub trade_id: u32,
    pub price: Price,
    pub quantity: u64,
    pub aggressor: Side,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotEvent {
    pub instrument_id: InstrumentId,
    /// Last rptSeq applied to the instrument; a snapshot does not consume one.
    pub rpt_seq: u32,
    pub timestamp: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub stats: MarketStats,
    pub status: TradingStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatisticsEvent {
    pub instrument_id: InstrumentId,
    pub rpt_seq: u32,
    pub timestamp: u64,
    pub stats: MarketStats,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusEvent {
    pub instrument_id: InstrumentId,
    pub rpt_seq: u32,
    pub timestamp: u64,
    pub status: TradingStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchEntry {
    Quote(QuoteUpdate),
    Trade(TradeEvent),
}

impl BatchEntry {
    pub fn instrument_id(&self) -> InstrumentId {
        match self {
            BatchEntry::Quote(q) => q.instrument_id,
            BatchEntry::Trade(t) => t.instrument_id,
        }
    }
}

/// Several book changes generated against one packet timestamp.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchEvent {
    pub timestamp: u64,
    pub entries: Vec<BatchEntry>,
}

impl BatchEvent {
    pub fn quotes(&self) -> impl Iterator<Item = &QuoteUpdate> {
        self.entries.iter().filter_map(|e| match e {
            BatchEntry::Quote(q) => Some(q),
            BatchEntry::Trade(_) => None,
        })
    }

    pub fn trades(&self) -> impl Iterator<Item = &TradeEvent> {
        self.entries.iter().filter_map(|e| match e {
            BatchEntry::Trade(t) => Some(t),
            BatchEntry::Quote(_) => None,
        })
    }
}

/// Immutable once built; fanned out to every listener and then dropped.
#[derive(Clone, Debug, PartialEq)]
pub enum MarketEvent {
    QuoteUpdate(QuoteUpdate),
    Trade(TradeEvent),
    Snapshot(SnapshotEvent),
    Statistics(StatisticsEvent),
    StatusChange(StatusEvent),
    Batch(BatchEvent),
}

impl MarketEvent {
    /// The single instrument the event concerns; `None` for a batch, which may span several.
    pub fn instrument_id(&self) -> Option<InstrumentId> {
        match self {
            MarketEvent::QuoteUpdate(e) => Some(e.instrument_id),
            MarketEvent::Trade(e) => Some(e.instrument_id),
            MarketEvent::Snapshot(e) => Some(e.instrument_id),
            MarketEvent::Statistics(e) => Some(e.instrument_id),
            MarketEvent::StatusChange(e) => Some(e.instrument_id),
            MarketEvent::Batch(_) => None,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            MarketEvent::QuoteUpdate(e) => e.timestamp,
            MarketEvent::Trade(e) => e.timestamp,
            MarketEvent::Snapshot(e) => e.timestamp,
            MarketEvent::Statistics(e) => e.timestamp,
            MarketEvent::StatusChange(e) => e.timestamp,
            MarketEvent::Batch(e) => e.timestamp,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MarketEvent::QuoteUpdate(_) => "quote_update",
            MarketEvent::Trade(_) => "trade",
            MarketEvent::Snapshot(_) => "snapshot",
            MarketEvent::Statistics(_) => "statistics",
            MarketEvent::StatusChange(_) => "status_change",
            MarketEvent::Batch(_) => "batch",
        }
    }
}

/// Implemented by each protocol adapter; the generator owns them as trait objects.
pub trait MarketEventListener {
    fn name(&self) -> &str;

    fn on_market_event(&mut self, event: &MarketEvent);

    /// Called once per loop iteration for the adapter's own I/O and timers. Must not block.
    fn poll(&mut self, _registry: &BookRegistry, _now: Instant) {}

    /// Flush and close before the process exits.
    fn shutdown(&mut self) {}
}
