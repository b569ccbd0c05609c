use std::collections::BTreeMap;
use std::collections::VecDeque;

use crate::engine::types::{
    now_nanos, Instrument, LevelChange, MarketStats, Price, PriceLevel, Side, Trade,
    TradingStatus,
};
use tracing::{debug, instrument, trace};

pub const DEFAULT_TRADE_CAPACITY: usize = 100;

/// Aggregated bid/ask ladder, recent trade tape and running statistics for one instrument.
///
/// Levels are keyed by price. Bids are read highest-first, asks lowest-first.
/// A level whose quantity reaches zero is removed, never kept as an empty entry.
#[derive(Debug, Clone)]
pub struct PriceLevelBook {
    instrument: Instrument,
    bids: BTreeMap<Price, PriceLevel>,
    asks: BTreeMap<Price, PriceLevel>,
    trades: VecDeque<Trade>,
    trade_capacity: usize,
    stats: MarketStats,
    status: TradingStatus,
}

impl PriceLevelBook {
    pub fn new(instrument: Instrument) -> Self {
        Self::with_trade_capacity(instrument, DEFAULT_TRADE_CAPACITY)
    }

    pub fn with_trade_capacity(instrument: Instrument, trade_capacity: usize) -> Self {
        let trade_capacity = trade_capacity.max(1);
        PriceLevelBook {
            instrument,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            trades: VecDeque::with_capacity(trade_capacity),
            trade_capacity,
            stats: MarketStats::default(),
            status: TradingStatus::Open,
        }
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    pub fn upsert_bid(&mut self, price: Price, quantity: u64) -> Option<LevelChange> {
        self.upsert(Side::Buy, price, quantity, now_nanos())
    }

    pub fn upsert_ask(&mut self, price: Price, quantity: u64) -> Option<LevelChange> {
        self.upsert(Side::Sell, price, quantity, now_nanos())
    }

    /// Sets the absolute quantity resting at `price`.
    ///
    /// Returns `None` when nothing changed: a zero quantity for a price that has no level,
    /// or a non-positive price.
    #[instrument(level = "trace", skip(self), fields(instrument_id = self.instrument.id))]
    pub fn upsert(&mut self, side: Side, price: Price, quantity: u64, ts: u64) -> Option<LevelChange> {
        if price.mantissa() <= 0 {
            debug!(%price, "Ignoring level update at non-positive price");
            return None;
        }

        let ladder = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };

        if quantity == 0 {
            return ladder.remove(&price).map(|_| {
                trace!(?side, %price, "Removed level");
                LevelChange::Delete
            });
        }

        match ladder.get_mut(&price) {
            Some(level) => {
                // Growth reads as one more order joining, shrinkage as one leaving.
                if quantity > level.quantity {
                    level.order_count = level.order_count.saturating_add(1);
                } else if quantity < level.quantity {
                    level.order_count = level.order_count.saturating_sub(1).max(1);
                }
                level.quantity = quantity;
                level.updated_at = ts;
                Some(LevelChange::Change)
            }
            None => {
                ladder.insert(price, PriceLevel { price, quantity, order_count: 1, updated_at: ts });
                trace!(?side, %price, quantity, "Inserted level");
                Some(LevelChange::New)
            }
        }
    }

    pub fn add_trade(&mut self, price: Price, quantity: u64, aggressor: Side) {
        self.record_trade(Trade { price, quantity, timestamp: now_nanos(), aggressor });
    }

    /// Appends to the trade ring, evicting the oldest entry beyond capacity, and refines the stats.
    pub fn record_trade(&mut self, trade: Trade) {
        if self.trades.len() == self.trade_capacity {
            self.trades.pop_front();
        }
        self.trades.push_back(trade);
        self.stats.apply_trade(trade.price, trade.quantity);
        trace!(
            instrument_id = self.instrument.id,
            price = %trade.price,
            quantity = trade.quantity,
            "Recorded trade"
        );
    }

    pub fn best_bid(&self) -> Option<Price> {
        self.bids.keys().next_back().copied()
    }

    pub fn best_ask(&self) -> Option<Price> {
        self.asks.keys().next().copied()
    }

    pub fn best_price(&self, side: Side) -> Option<Price> {
        match side {
            Side::Buy => self.best_bid(),
            Side::Sell => self.best_ask(),
        }
    }

    pub fn best_level(&self, side: Side) -> Option<&PriceLevel> {
        match side {
            Side::Buy => self.bids.values().next_back(),
            Side::Sell => self.asks.values().next(),
        }
    }

    pub fn level(&self, side: Side, price: Price) -> Option<&PriceLevel> {
        match side {
            Side::Buy => self.bids.get(&price),
            Side::Sell => self.asks.get(&price),
        }
    }

    /// 1-based depth position of `price` on `side`, best level first.
    pub fn level_position(&self, side: Side, price: Price) -> Option<usize> {
        match side {
            Side::Buy => {
                if !self.bids.contains_key(&price) {
                    return None;
                }
                Some(self.bids.range(price..).count())
            }
            Side::Sell => {
                if !self.asks.contains_key(&price) {
                    return None;
                }
                Some(self.asks.range(..=price).count())
            }
        }
    }

    pub fn level_count(&self, side: Side) -> usize {
        match side {
            Side::Buy => self.bids.len(),
            Side::Sell => self.asks.len(),
        }
    }

    /// Average of the touch prices; `None` unless both sides are populated.
    pub fn mid(&self) -> Option<Price> {
        let (bid, ask) = (self.best_bid()?, self.best_ask()?);
        Some(Price::from_mantissa((bid.mantissa() + ask.mantissa()) / 2))
    }

    pub fn spread(&self) -> Option<Price> {
        let best_bid = self.best_bid()?;
        let best_ask = self.best_ask()?;
        Some(best_ask - best_bid)
    }

    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }

    /// Up to `max_levels` levels of one side, best first.
    pub fn depth(&self, side: Side, max_levels: usize) -> Vec<PriceLevel> {
        match side {
            Side::Buy => self.bids.values().rev().take(max_levels).copied().collect(),
            Side::Sell => self.asks.values().take(max_levels).copied().collect(),
        }
    }

    pub fn bid_depth(&self, max_levels: usize) -> Vec<PriceLevel> {
        self.depth(Side::Buy, max_levels)
    }

    pub fn ask_depth(&self, max_levels: usize) -> Vec<PriceLevel> {
        self.depth(Side::Sell, max_levels)
    }

    pub fn recent_trades(&self) -> impl Iterator<Item = &Trade> {
        self.trades.iter()
    }

    pub fn trade_capacity(&self) -> usize {
        self.trade_capacity
    }

    pub fn stats(&self) -> &MarketStats {
        &self.stats
    }

    pub fn trading_status(&self) -> TradingStatus {
        self.status
    }

    pub fn set_trading_status(&mut self, status: TradingStatus) {
        self.status = status;
    }

    pub fn set_settlement(&mut self, price: Price) {
        self.stats.settlement = Some(price);
    }

    /// Empties both ladders and the trade ring and resets the statistics.
    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.trades.clear();
        self.stats = MarketStats::default();
        debug!(instrument_id = self.instrument.id, "Cleared book");
    }
}
