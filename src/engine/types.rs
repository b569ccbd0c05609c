use std::fmt;
use std::ops::{Add, Sub};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub type InstrumentId = u32;

/// Implied decimals carried by every `Price` mantissa.
pub const PRICE_EXPONENT: i32 = -9;
pub const PRICE_SCALE: i64 = 1_000_000_000;

/// Fixed-point price: mantissa with nine implied decimal places.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(i64);

impl Price {
    pub const ZERO: Price = Price(0);

    pub const fn from_mantissa(mantissa: i64) -> Self {
        Price(mantissa)
    }

    pub const fn mantissa(self) -> i64 {
        self.0
    }

    pub fn from_f64(value: f64) -> Self {
        Price((value * PRICE_SCALE as f64).round() as i64)
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / PRICE_SCALE as f64
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Nearest multiple of `tick`, halves rounding up. A non-positive tick leaves the price unchanged.
    pub fn round_to_tick(self, tick: Price) -> Price {
        if tick.0 <= 0 {
            return self;
        }
        let q = self.0.div_euclid(tick.0);
        let r = self.0.rem_euclid(tick.0);
        let ticks = if r * 2 >= tick.0 { q + 1 } else { q };
        Price(ticks.saturating_mul(tick.0))
    }

    pub fn ticks(self, count: i64) -> Price {
        Price(self.0.saturating_mul(count))
    }
}

impl Add for Price {
    type Output = Price;
    fn add(self, rhs: Price) -> Price {
        Price(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Price {
    type Output = Price;
    fn sub(self, rhs: Price) -> Price {
        Price(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let whole = abs / PRICE_SCALE as u64;
        let frac = abs % PRICE_SCALE as u64;
        if frac == 0 {
            return write!(f, "{sign}{whole}");
        }
        let digits = format!("{frac:09}");
        write!(f, "{sign}{whole}.{}", digits.trim_end_matches('0'))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Aggregated resting quantity at one price on one side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PriceLevel {
    pub price: Price,
    pub quantity: u64,
    pub order_count: u32,
    pub updated_at: u64,
}

/// What an absolute-quantity upsert did to the ladder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LevelChange {
    New,
    Change,
    Delete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Trade {
    pub price: Price,
    pub quantity: u64,
    pub timestamp: u64,
    pub aggressor: Side,
}

/// Running session statistics, refined only by trades.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MarketStats {
    pub open: Option<Price>,
    pub high: Option<Price>,
    pub low: Option<Price>,
    pub last: Option<Price>,
    pub settlement: Option<Price>,
    pub volume: u64,
    pub trade_count: u64,
    // sum(price mantissa * quantity)
    turnover: i128,
}

impl MarketStats {
    pub fn apply_trade(&mut self, price: Price, quantity: u64) {
        if self.open.is_none() {
            self.open = Some(price);
        }
        self.high = Some(self.high.map_or(price, |h| h.max(price)));
        self.low = Some(self.low.map_or(price, |l| l.min(price)));
        self.last = Some(price);
        self.volume = self.volume.saturating_add(quantity);
        self.trade_count += 1;
        self.turnover += price.mantissa() as i128 * quantity as i128;
    }

    /// Volume-weighted average price; `None` until some quantity has traded.
    pub fn vwap(&self) -> Option<Price> {
        if self.volume == 0 {
            return None;
        }
        Some(Price::from_mantissa((self.turnover / self.volume as i128) as i64))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstrumentKind {
    Future {
        underlying: String,
        /// YYYYMM
        maturity: u32,
        contract_multiplier: u32,
    },
    FxSpot {
        base_currency: String,
        quote_currency: String,
        settlement_days: u8,
    },
    Generic {
        description: String,
    },
}

impl Default for InstrumentKind {
    fn default() -> Self {
        InstrumentKind::Generic { description: String::new() }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Instrument {
    pub id: InstrumentId,
    pub symbol: String,
    pub tick_size: Price,
    pub kind: InstrumentKind,
}

/// Values follow the CME SecurityTradingStatus enumeration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingStatus {
    Halt = 2,
    Close = 4,
    Open = 17,
    NotAvailable = 18,
    PreOpen = 21,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BookError {
    #[error("instrument {id} is already registered")]
    DuplicateInstrument { id: InstrumentId },
    #[error("instrument {id} is not registered")]
    UnknownInstrument { id: InstrumentId },
    #[error("tick size must be positive for instrument {id}")]
    InvalidTickSize { id: InstrumentId },
}

/// Wall-clock nanoseconds since the Unix epoch.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
