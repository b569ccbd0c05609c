use std::cell::RefCell;
use std::rc::Rc;

use ahash::AHashMap;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

use mdfeed_sim::engine::book::PriceLevelBook;
use mdfeed_sim::engine::registry::BookRegistry;
use mdfeed_sim::engine::types::{Instrument, InstrumentKind, Price, Side};
use mdfeed_sim::market_data::events::{BatchEntry, MarketEvent, MarketEventListener};
use mdfeed_sim::market_data::generator::{GenerationEngine, GeneratorConfig};

fn instrument(id: u32, tick: f64) -> Instrument {
    Instrument {
        id,
        symbol: format!("SYM{id}"),
        tick_size: Price::from_f64(tick),
        kind: InstrumentKind::default(),
    }
}

struct Capture(Rc<RefCell<Vec<MarketEvent>>>);

impl MarketEventListener for Capture {
    fn name(&self) -> &str {
        "capture"
    }

    fn on_market_event(&mut self, event: &MarketEvent) {
        self.0.borrow_mut().push(event.clone());
    }
}

fn op() -> impl Strategy<Value = (bool, i64, u64)> {
    (any::<bool>(), 1i64..200, prop_oneof![Just(0u64), 1u64..500])
}

proptest! {
    #[test]
    fn upserts_keep_ladders_sorted_and_nonzero(ops in proptest::collection::vec(op(), 1..200)) {
        let mut book = PriceLevelBook::new(instrument(1, 0.25));
        for (buy, ticks, qty) in ops {
            let side = if buy { Side::Buy } else { Side::Sell };
            book.upsert(side, Price::from_f64(0.25).ticks(ticks), qty, 0);
        }

        let bids = book.bid_depth(usize::MAX);
        let asks = book.ask_depth(usize::MAX);
        prop_assert!(bids.windows(2).all(|w| w[0].price > w[1].price));
        prop_assert!(asks.windows(2).all(|w| w[0].price < w[1].price));
        prop_assert!(bids.iter().chain(asks.iter()).all(|l| l.quantity > 0 && l.order_count >= 1));
        prop_assert_eq!(book.best_bid(), bids.first().map(|l| l.price));
        prop_assert_eq!(book.best_ask(), asks.first().map(|l| l.price));
    }

    #[test]
    fn generated_books_stay_uncrossed_and_bounded(seed in any::<u64>(), batches in 1usize..60, max_depth in 1usize..12) {
        let mut registry = BookRegistry::new();
        registry.register(instrument(1, 0.25), Price::from_f64(4500.0), Price::from_f64(0.25)).unwrap();
        registry.register(instrument(2, 0.00001), Price::from_f64(1.085), Price::from_f64(0.0001)).unwrap();
        // Pinned at one tick, so quotes have no room below the touch.
        registry.register(instrument(3, 1.0), Price::from_f64(1.0), Price::ZERO).unwrap();

        let config = GeneratorConfig { max_depth, ..GeneratorConfig::default() };
        let mut engine = GenerationEngine::with_rng(config, StdRng::seed_from_u64(seed));
        let events = Rc::new(RefCell::new(Vec::new()));
        engine.add_listener(Box::new(Capture(events.clone())));

        for _ in 0..batches {
            engine.generate_batch(&mut registry, 8);
            for book in registry.books() {
                prop_assert!(!book.is_crossed());
                prop_assert!(book.bid_depth(usize::MAX).iter().all(|l| l.price.mantissa() > 0));
                prop_assert!(book.level_count(Side::Buy) <= max_depth.max(5));
                prop_assert!(book.level_count(Side::Sell) <= max_depth.max(5));
            }
        }

        // Every emitted entry advances its instrument's rptSeq by exactly one.
        let mut last: AHashMap<u32, u32> = AHashMap::new();
        for event in events.borrow().iter() {
            let MarketEvent::Batch(batch) = event else { continue };
            for entry in &batch.entries {
                let (id, seq) = match entry {
                    BatchEntry::Quote(q) => (q.instrument_id, q.rpt_seq),
                    BatchEntry::Trade(t) => (t.instrument_id, t.rpt_seq),
                };
                if let Some(prev) = last.insert(id, seq) {
                    prop_assert_eq!(seq, prev + 1);
                }
            }
        }
    }
}
