use ahash::AHashMap;
use tracing::{info, warn};

use crate::engine::book::PriceLevelBook;
use crate::engine::types::{now_nanos, BookError, Instrument, InstrumentId, Price, Side};

/// Levels seeded on each side at registration.
pub const SEED_LEVELS: i64 = 5;
/// Quantity of the touch level when seeding; deeper levels grow linearly from it.
pub const SEED_BASE_QUANTITY: u64 = 10;

/// Owns every instrument's book. Adapters look books up by id, never hold them.
#[derive(Debug, Default)]
pub struct BookRegistry {
    books: AHashMap<InstrumentId, PriceLevelBook>,
}

impl BookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a book seeded with a symmetric ladder.
    ///
    /// Bids start at `initial_price` and step down one tick per level; asks start at
    /// `initial_price + initial_spread` and step up. Quantity grows linearly with depth.
    /// The initial price doubles as the prior settlement.
    pub fn register(
        &mut self,
        instrument: Instrument,
        initial_price: Price,
        initial_spread: Price,
    ) -> Result<(), BookError> {
        let id = instrument.id;
        if self.books.contains_key(&id) {
            let error = BookError::DuplicateInstrument { id };
            warn!(instrument_id = id, symbol = %instrument.symbol, error = %error, "Rejecting registration");
            return Err(error);
        }
        if instrument.tick_size.mantissa() <= 0 {
            let error = BookError::InvalidTickSize { id };
            warn!(instrument_id = id, error = %error, "Rejecting registration");
            return Err(error);
        }

        let tick = instrument.tick_size;
        let best_bid = initial_price.round_to_tick(tick);
        let best_ask = (initial_price + initial_spread).round_to_tick(tick).max(best_bid + tick);
        let symbol = instrument.symbol.clone();

        let mut book = PriceLevelBook::new(instrument);
        let ts = now_nanos();
        for level in 0..SEED_LEVELS {
            let quantity = SEED_BASE_QUANTITY * (level as u64 + 1);
            let bid = best_bid - tick.ticks(level);
            if bid.mantissa() > 0 {
                book.upsert(Side::Buy, bid, quantity, ts);
            }
            book.upsert(Side::Sell, best_ask + tick.ticks(level), quantity, ts);
        }
        book.set_settlement(initial_price);

        info!(instrument_id = id, %symbol, %best_bid, %best_ask, "Registered instrument");
        self.books.insert(id, book);
        Ok(())
    }

    pub fn lookup(&self, id: InstrumentId) -> Result<&PriceLevelBook, BookError> {
        self.books.get(&id).ok_or(BookError::UnknownInstrument { id })
    }

    pub fn lookup_mut(&mut self, id: InstrumentId) -> Result<&mut PriceLevelBook, BookError> {
        self.books.get_mut(&id).ok_or(BookError::UnknownInstrument { id })
    }

    pub fn contains(&self, id: InstrumentId) -> bool {
        self.books.contains_key(&id)
    }

    /// Registered ids in no particular order.
    pub fn all_ids(&self) -> Vec<InstrumentId> {
        self.books.keys().copied().collect()
    }

    /// Registered ids, ascending.
    pub fn sorted_ids(&self) -> Vec<InstrumentId> {
        let mut ids = self.all_ids();
        ids.sort_unstable();
        ids
    }

    pub fn books(&self) -> impl Iterator<Item = &PriceLevelBook> {
        self.books.values()
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }

    /// Empties every book but keeps the registrations.
    pub fn clear_all(&mut self) {
        for book in self.books.values_mut() {
            book.clear();
        }
        info!(instruments = self.books.len(), "Cleared all books");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::InstrumentKind;

    fn instrument(id: InstrumentId) -> Instrument {
        Instrument {
            id,
            symbol: format!("SYM{id}"),
            tick_size: Price::from_f64(0.25),
            kind: InstrumentKind::Future {
                underlying: "ES".into(),
                maturity: 202612,
                contract_multiplier: 50,
            },
        }
    }

    #[test]
    fn test_register_seeds_symmetric_ladder() {
        let mut registry = BookRegistry::new();
        registry
            .register(instrument(7), Price::from_f64(100.0), Price::from_f64(0.5))
            .unwrap();
        let book = registry.lookup(7).unwrap();

        let bids = book.bid_depth(10);
        let asks = book.ask_depth(10);
        assert_eq!(bids.len(), 5);
        assert_eq!(asks.len(), 5);
        assert_eq!(bids[0].price, Price::from_f64(100.0));
        assert_eq!(bids[4].price, Price::from_f64(99.0));
        assert_eq!(asks[0].price, Price::from_f64(100.5));
        assert_eq!(asks[4].price, Price::from_f64(101.5));
        let quantities: Vec<u64> = bids.iter().map(|l| l.quantity).collect();
        assert_eq!(quantities, vec![10, 20, 30, 40, 50]);
        assert_eq!(book.stats().settlement, Some(Price::from_f64(100.0)));
        assert!(!book.is_crossed());
    }

    #[test]
    fn test_duplicate_registration_leaves_book_untouched() {
        let mut registry = BookRegistry::new();
        registry
            .register(instrument(7), Price::from_f64(100.0), Price::from_f64(0.5))
            .unwrap();
        let before = registry.lookup(7).unwrap().bid_depth(10);

        let err = registry
            .register(instrument(7), Price::from_f64(200.0), Price::from_f64(1.0))
            .unwrap_err();
        assert_eq!(err, BookError::DuplicateInstrument { id: 7 });
        assert_eq!(registry.lookup(7).unwrap().bid_depth(10), before);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_seed_ladder_stops_at_minimum_price() {
        let mut registry = BookRegistry::new();
        let mut penny = instrument(4);
        penny.tick_size = Price::from_f64(1.0);
        registry.register(penny, Price::from_f64(2.0), Price::ZERO).unwrap();
        let book = registry.lookup(4).unwrap();

        let bids: Vec<Price> = book.bid_depth(10).iter().map(|l| l.price).collect();
        assert_eq!(bids, vec![Price::from_f64(2.0), Price::from_f64(1.0)]);
        assert_eq!(book.best_ask(), Some(Price::from_f64(3.0)));
        assert_eq!(book.level_count(Side::Sell), 5);
    }

    #[test]
    fn test_lookup_unknown() {
        let registry = BookRegistry::new();
        assert_eq!(registry.lookup(42).unwrap_err(), BookError::UnknownInstrument { id: 42 });
    }

    #[test]
    fn test_rejects_non_positive_tick() {
        let mut registry = BookRegistry::new();
        let mut bad = instrument(3);
        bad.tick_size = Price::ZERO;
        assert!(registry.register(bad, Price::from_f64(1.0), Price::from_f64(0.1)).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clear_all_keeps_registrations() {
        let mut registry = BookRegistry::new();
        for id in [1, 2] {
            registry
                .register(instrument(id), Price::from_f64(50.0), Price::from_f64(0.25))
                .unwrap();
        }
        registry.clear_all();
        assert_eq!(registry.sorted_ids(), vec![1, 2]);
        assert!(registry.books().all(|b| b.best_bid().is_none() && b.best_ask().is_none()));
    }
}
