// CME-style listener: turns market events into SBE payloads and hands them to the
// incremental and snapshot batchers.

use std::time::Instant;

use ahash::AHashMap;
use bytes::Bytes;
use tracing::{debug, info, warn};

use super::batcher::{Batcher, BatcherConfig, BatcherStats};
use super::schema::*;
use crate::engine::registry::BookRegistry;
use crate::engine::types::{now_nanos, InstrumentId, LevelChange, Price, Side};
use crate::market_data::events::{
    MarketEvent, MarketEventListener, QuoteUpdate, SnapshotEvent, StatisticsEvent,
    StatusEvent, TradeEvent,
};
use crate::sbe::{CodecError, MessageEncoder, NULL_I32, NULL_I8, NULL_U8};
use crate::transport::DatagramSink;

/// Entries per incremental message; keeps one message well inside a 1420-byte packet.
pub const MAX_ENTRIES_PER_MESSAGE: usize = 32;

const NANOS_PER_DAY: u64 = 86_400 * 1_000_000_000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CmeFeedStats {
    pub messages_encoded: u64,
    pub encode_errors: u64,
    pub snapshots: u64,
}

pub struct CmeFeed<S: DatagramSink> {
    incremental: Batcher<S>,
    snapshot: Batcher<S>,
    symbols: AHashMap<InstrumentId, String>,
    instrument_count: u32,
    stats: CmeFeedStats,
}

impl<S: DatagramSink> CmeFeed<S> {
    pub fn new(incremental: S, snapshot: S, incremental_config: BatcherConfig, snapshot_config: BatcherConfig) -> Self {
        CmeFeed {
            incremental: Batcher::new("incremental", incremental, incremental_config),
            snapshot: Batcher::new("snapshot", snapshot, snapshot_config),
            symbols: AHashMap::new(),
            instrument_count: 0,
            stats: CmeFeedStats::default(),
        }
    }

    pub fn incremental(&self) -> &Batcher<S> {
        &self.incremental
    }

    pub fn snapshot_channel(&self) -> &Batcher<S> {
        &self.snapshot
    }

    pub fn stats(&self) -> CmeFeedStats {
        self.stats
    }

    pub fn incremental_stats(&self) -> BatcherStats {
        self.incremental.stats()
    }

    pub fn snapshot_stats(&self) -> BatcherStats {
        self.snapshot.stats()
    }

    /// Sends anything still queued on either channel.
    pub fn flush(&mut self) {
        let now = now_nanos();
        self.incremental.flush(now);
        self.snapshot.flush(now);
    }

    fn publish_incremental(&mut self, encoded: Result<Vec<Bytes>, CodecError>) {
        self.publish(encoded, false)
    }

    fn publish(&mut self, encoded: Result<Vec<Bytes>, CodecError>, snapshot: bool) {
        let payloads = match encoded {
            Ok(payloads) => payloads,
            Err(e) => {
                self.stats.encode_errors += 1;
                warn!(error = %e, "Failed to encode CME message");
                return;
            }
        };
        let batcher = if snapshot { &mut self.snapshot } else { &mut self.incremental };
        for payload in payloads {
            match batcher.push(payload, now_nanos()) {
                Ok(()) => self.stats.messages_encoded += 1,
                Err(e) => {
                    self.stats.encode_errors += 1;
                    warn!(error = %e, "Dropping CME message");
                }
            }
        }
    }

    fn symbol(&self, id: InstrumentId) -> &str {
        self.symbols.get(&id).map(String::as_str).unwrap_or("")
    }
}

impl<S: DatagramSink> MarketEventListener for CmeFeed<S> {
    fn name(&self) -> &str {
        "cme"
    }

    fn on_market_event(&mut self, event: &MarketEvent) {
        match event {
            MarketEvent::QuoteUpdate(q) => {
                self.publish_incremental(encode_book_refresh(q.timestamp, &[*q]).map(|m| vec![m]))
            }
            MarketEvent::Trade(t) => {
                self.publish_incremental(encode_trade_summary(t.timestamp, &[*t], true).map(|m| vec![m]))
            }
            MarketEvent::Batch(batch) => {
                let trades: Vec<TradeEvent> = batch.trades().copied().collect();
                let quotes: Vec<QuoteUpdate> = batch.quotes().copied().collect();
                self.publish_incremental(encode_batch(batch.timestamp, &trades, &quotes));
            }
            MarketEvent::Statistics(s) => self.publish_incremental(encode_statistics(s)),
            MarketEvent::StatusChange(s) => {
                let symbol = self.symbol(s.instrument_id).to_string();
                self.publish_incremental(encode_security_status(s, &symbol).map(|m| vec![m]));
            }
            MarketEvent::Snapshot(s) => {
                let last_seq = self.incremental.next_sequence().saturating_sub(1);
                let encoded = encode_snapshot(s, last_seq, self.instrument_count.max(1)).map(|m| vec![m]);
                self.publish(encoded, true);
                self.snapshot.flush(now_nanos());
                self.stats.snapshots += 1;
                debug!(instrument_id = s.instrument_id, rpt_seq = s.rpt_seq, "Published snapshot");
            }
        }
    }

    fn poll(&mut self, registry: &BookRegistry, _now: Instant) {
        if self.symbols.len() != registry.len() {
            self.symbols = registry.books().map(|b| (b.instrument().id, b.instrument().symbol.clone())).collect();
            self.instrument_count = u32::try_from(registry.len()).unwrap_or(u32::MAX);
        }
        self.incremental.flush(now_nanos());
    }

    fn shutdown(&mut self) {
        self.flush();
        let inc = self.incremental.stats();
        let snap = self.snapshot.stats();
        info!(
            incremental_packets = inc.packets,
            snapshot_packets = snap.packets,
            send_errors = inc.send_errors + snap.send_errors,
            "CME feed stopped"
        );
    }
}

fn entry_type(side: Side) -> &'static str {
    match side {
        Side::Buy => ENTRY_BID,
        Side::Sell => ENTRY_OFFER,
    }
}

fn update_action(change: LevelChange) -> u8 {
    match change {
        LevelChange::New => ACTION_NEW,
        LevelChange::Change => ACTION_CHANGE,
        LevelChange::Delete => ACTION_DELETE,
    }
}

fn aggressor(side: Side) -> u8 {
    match side {
        Side::Buy => AGGRESSOR_BUY,
        Side::Sell => AGGRESSOR_SELL,
    }
}

fn trade_date(timestamp: u64) -> u64 {
    timestamp / NANOS_PER_DAY
}

/// Trade summaries first, then book changes; the last message closes the event.
pub fn encode_batch(timestamp: u64, trades: &[TradeEvent], quotes: &[QuoteUpdate]) -> Result<Vec<Bytes>, CodecError> {
    let mut out = Vec::new();
    let trade_chunks: Vec<&[TradeEvent]> = trades.chunks(MAX_ENTRIES_PER_MESSAGE).collect();
    let quote_chunks: Vec<&[QuoteUpdate]> = quotes.chunks(MAX_ENTRIES_PER_MESSAGE).collect();
    for (i, chunk) in trade_chunks.iter().enumerate() {
        let last = quote_chunks.is_empty() && i + 1 == trade_chunks.len();
        out.push(encode_trade_summary(timestamp, chunk, last)?);
    }
    for chunk in quote_chunks {
        out.push(encode_book_refresh(timestamp, chunk)?);
    }
    Ok(out)
}

pub fn encode_book_refresh(timestamp: u64, quotes: &[QuoteUpdate]) -> Result<Bytes, CodecError> {
    let mut enc = MessageEncoder::new(&SCHEMA, BOOK_REFRESH)?;
    enc.set_field("TransactTime", timestamp)?;
    enc.set_field("MatchEventIndicator", MEI_LAST_QUOTE | MEI_END_OF_EVENT)?;
    for q in quotes {
        let e = enc.add_entry(ENTRIES)?;
        enc.set_entry_field(ENTRIES, e, "MDEntryPx", q.price.mantissa())?;
        enc.set_entry_field(ENTRIES, e, "MDEntrySize", q.quantity)?;
        enc.set_entry_field(ENTRIES, e, "SecurityID", u64::from(q.instrument_id))?;
        enc.set_entry_field(ENTRIES, e, "RptSeq", q.rpt_seq)?;
        enc.set_entry_field(ENTRIES, e, "NumberOfOrders", u64::from(q.order_count))?;
        enc.set_entry_field(ENTRIES, e, "MDPriceLevel", q.level)?;
        enc.set_entry_field(ENTRIES, e, "MDUpdateAction", update_action(q.action))?;
        enc.set_entry_field(ENTRIES, e, "MDEntryType", entry_type(q.side))?;
    }
    Ok(enc.encode())
}

pub fn encode_trade_summary(timestamp: u64, trades: &[TradeEvent], end_of_event: bool) -> Result<Bytes, CodecError> {
    let mut enc = MessageEncoder::new(&SCHEMA, TRADE_SUMMARY)?;
    enc.set_field("TransactTime", timestamp)?;
    let mei = if end_of_event { MEI_LAST_TRADE | MEI_END_OF_EVENT } else { MEI_LAST_TRADE };
    enc.set_field("MatchEventIndicator", mei)?;
    for t in trades {
        let e = enc.add_entry(ENTRIES)?;
        enc.set_entry_field(ENTRIES, e, "MDEntryPx", t.price.mantissa())?;
        enc.set_entry_field(ENTRIES, e, "MDEntrySize", t.quantity)?;
        enc.set_entry_field(ENTRIES, e, "SecurityID", u64::from(t.instrument_id))?;
        enc.set_entry_field(ENTRIES, e, "RptSeq", t.rpt_seq)?;
        enc.set_entry_field(ENTRIES, e, "NumberOfOrders", 2i32)?;
        enc.set_entry_field(ENTRIES, e, "AggressorSide", aggressor(t.aggressor))?;
        enc.set_entry_field(ENTRIES, e, "MDUpdateAction", ACTION_NEW)?;
        enc.set_entry_field(ENTRIES, e, "MDTradeEntryID", t.trade_id)?;
    }
    Ok(enc.encode())
}

/// Session statistics (open, high, low, settlement, VWAP) followed by a volume message.
pub fn encode_statistics(s: &StatisticsEvent) -> Result<Vec<Bytes>, CodecError> {
    let stats = &s.stats;
    let entries: [(&str, Option<Price>); 5] = [
        (ENTRY_OPEN, stats.open),
        (ENTRY_HIGH, stats.high),
        (ENTRY_LOW, stats.low),
        (ENTRY_SETTLEMENT, stats.settlement),
        (ENTRY_VWAP, stats.vwap()),
    ];

    let mut enc = MessageEncoder::new(&SCHEMA, SESSION_STATISTICS)?;
    enc.set_field("TransactTime", s.timestamp)?;
    enc.set_field("MatchEventIndicator", MEI_LAST_STATS)?;
    for (kind, price) in entries {
        let Some(price) = price else { continue };
        let e = enc.add_entry(ENTRIES)?;
        enc.set_entry_field(ENTRIES, e, "MDEntryPx", price.mantissa())?;
        enc.set_entry_field(ENTRIES, e, "SecurityID", u64::from(s.instrument_id))?;
        enc.set_entry_field(ENTRIES, e, "RptSeq", s.rpt_seq)?;
        enc.set_entry_field(ENTRIES, e, "OpenCloseSettlFlag", NULL_U8)?;
        enc.set_entry_field(ENTRIES, e, "MDUpdateAction", ACTION_NEW)?;
        enc.set_entry_field(ENTRIES, e, "MDEntryType", kind)?;
        enc.set_entry_field(ENTRIES, e, "MDEntrySize", 0i32)?;
    }

    let mut volume = MessageEncoder::new(&SCHEMA, VOLUME)?;
    volume.set_field("TransactTime", s.timestamp)?;
    volume.set_field("MatchEventIndicator", MEI_LAST_STATS | MEI_END_OF_EVENT)?;
    let e = volume.add_entry(ENTRIES)?;
    volume.set_entry_field(ENTRIES, e, "MDEntrySize", stats.volume)?;
    volume.set_entry_field(ENTRIES, e, "SecurityID", u64::from(s.instrument_id))?;
    volume.set_entry_field(ENTRIES, e, "RptSeq", s.rpt_seq)?;
    volume.set_entry_field(ENTRIES, e, "MDUpdateAction", ACTION_NEW)?;

    Ok(vec![enc.encode(), volume.encode()])
}

pub fn encode_security_status(s: &StatusEvent, symbol: &str) -> Result<Bytes, CodecError> {
    let code: String = symbol.chars().filter(char::is_ascii_alphanumeric).take(6).collect();
    let mut enc = MessageEncoder::new(&SCHEMA, SECURITY_STATUS)?;
    enc.set_field("TransactTime", s.timestamp)?;
    enc.set_field("SecurityGroup", code.as_str())?;
    enc.set_field("Asset", code.as_str())?;
    enc.set_field("SecurityID", u64::from(s.instrument_id))?;
    enc.set_field("TradeDate", trade_date(s.timestamp))?;
    enc.set_field("MatchEventIndicator", MEI_END_OF_EVENT)?;
    enc.set_field("SecurityTradingStatus", s.status as u8)?;
    enc.set_field("HaltReason", 0u8)?;
    enc.set_field("SecurityTradingEvent", 0u8)?;
    Ok(enc.encode())
}

pub fn encode_snapshot(s: &SnapshotEvent, last_msg_seq: u32, total_reports: u32) -> Result<Bytes, CodecError> {
    let mut enc = MessageEncoder::new(&SCHEMA, SNAPSHOT_FULL_REFRESH)?;
    enc.set_field("LastMsgSeqNumProcessed", last_msg_seq)?;
    enc.set_field("TotNumReports", total_reports)?;
    enc.set_field("SecurityID", u64::from(s.instrument_id))?;
    enc.set_field("RptSeq", s.rpt_seq)?;
    enc.set_field("TransactTime", s.timestamp)?;
    enc.set_field("LastUpdateTime", s.timestamp)?;
    enc.set_field("TradeDate", trade_date(s.timestamp))?;
    enc.set_field("MDSecurityTradingStatus", s.status as u8)?;

    for (side, levels) in [(Side::Buy, &s.bids), (Side::Sell, &s.asks)] {
        for (level, level_no) in levels.iter().take(MAX_SNAPSHOT_DEPTH).zip(1i8..) {
            let e = enc.add_entry(ENTRIES)?;
            enc.set_entry_field(ENTRIES, e, "MDEntryPx", level.price.mantissa())?;
            enc.set_entry_field(ENTRIES, e, "MDEntrySize", level.quantity)?;
            enc.set_entry_field(ENTRIES, e, "NumberOfOrders", u64::from(level.order_count))?;
            enc.set_entry_field(ENTRIES, e, "MDPriceLevel", level_no)?;
            enc.set_entry_field(ENTRIES, e, "MDEntryType", entry_type(side))?;
        }
    }

    let stats = &s.stats;
    let priced = [
        (ENTRY_TRADE, stats.last),
        (ENTRY_OPEN, stats.open),
        (ENTRY_HIGH, stats.high),
        (ENTRY_LOW, stats.low),
        (ENTRY_SETTLEMENT, stats.settlement),
    ];
    for (kind, price) in priced {
        let Some(price) = price else { continue };
        let e = snapshot_stat_entry(&mut enc, kind)?;
        enc.set_entry_field(ENTRIES, e, "MDEntryPx", price.mantissa())?;
    }
    if stats.volume > 0 {
        let e = snapshot_stat_entry(&mut enc, ENTRY_VOLUME)?;
        enc.set_entry_field(ENTRIES, e, "MDEntrySize", stats.volume)?;
    }
    Ok(enc.encode())
}

/// Statistics entries carry no size, order count or level.
fn snapshot_stat_entry(enc: &mut MessageEncoder, kind: &str) -> Result<usize, CodecError> {
    let e = enc.add_entry(ENTRIES)?;
    enc.set_entry_field(ENTRIES, e, "MDEntrySize", NULL_I32)?;
    enc.set_entry_field(ENTRIES, e, "NumberOfOrders", NULL_I32)?;
    enc.set_entry_field(ENTRIES, e, "MDPriceLevel", NULL_I8)?;
    enc.set_entry_field(ENTRIES, e, "MDEntryType", kind)?;
    Ok(e)
}
