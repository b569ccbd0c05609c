// Market data module entrypoint
pub mod events;     // event model fanned out to feed adapters
pub mod generator;  // random-walk engine producing those events
