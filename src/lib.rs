pub mod cme;
pub mod config;
pub mod engine;
pub mod market_data;
pub mod reuters;
pub mod sbe;
pub mod service;
pub mod telemetry;
pub mod transport;
