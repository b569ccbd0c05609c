//! Runtime configuration: built-in defaults, then an optional TOML file, then
//! `MDFEED__SECTION__KEY` environment variables.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use ahash::AHashSet;
use serde::{Deserialize, Serialize};

use crate::cme::BatcherConfig;
use crate::engine::types::{Instrument, InstrumentId, InstrumentKind, Price};
use crate::market_data::generator::GeneratorConfig;
use crate::reuters::{Credential, ServerConfig};

pub const ENV_PREFIX: &str = "MDFEED";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] ::config::ConfigError),
    #[error("instrument id {0} is configured more than once")]
    DuplicateInstrument(InstrumentId),
    #[error("instrument {symbol} needs a positive tick size and initial price")]
    InvalidInstrument { symbol: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("max_packet_bytes {0} cannot hold a packet header")]
    PacketTooSmall(usize),
    #[error("generator.snapshot_depth {depth} exceeds the {max} levels a snapshot can carry")]
    SnapshotTooDeep { depth: usize, max: usize },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CmeConfig {
    pub enabled: bool,
    pub bind: SocketAddr,
    pub incremental: SocketAddr,
    pub snapshot: SocketAddr,
    pub multicast_ttl: u32,
    pub batch_size: usize,
    pub max_packet_bytes: usize,
    pub sequence_base: u32,
}

impl Default for CmeConfig {
    fn default() -> Self {
        CmeConfig {
            enabled: true,
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            incremental: SocketAddr::from(([239, 1, 1, 1], 14310)),
            snapshot: SocketAddr::from(([239, 1, 1, 2], 14311)),
            multicast_ttl: 1,
            batch_size: 8,
            max_packet_bytes: 1420,
            sequence_base: 1,
        }
    }
}

impl CmeConfig {
    pub fn batcher(&self) -> BatcherConfig {
        BatcherConfig {
            batch_size: self.batch_size,
            max_packet_bytes: self.max_packet_bytes,
            sequence_base: self.sequence_base,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReutersConfig {
    pub enabled: bool,
    pub listen: SocketAddr,
    pub session_timeout_ms: u64,
    pub default_keepalive_ms: u64,
    pub max_sessions: usize,
    /// Empty admits any username and password.
    pub credentials: Vec<Credential>,
}

impl Default for ReutersConfig {
    fn default() -> Self {
        ReutersConfig {
            enabled: true,
            listen: SocketAddr::from(([0, 0, 0, 0], 14400)),
            session_timeout_ms: 30_000,
            default_keepalive_ms: 10_000,
            max_sessions: 64,
            credentials: Vec::new(),
        }
    }
}

impl ReutersConfig {
    pub fn server(&self, snapshot_depth: usize) -> ServerConfig {
        ServerConfig {
            session_timeout: Duration::from_millis(self.session_timeout_ms),
            default_keepalive: Duration::from_millis(self.default_keepalive_ms),
            max_sessions: self.max_sessions,
            snapshot_depth,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    pub id: InstrumentId,
    pub symbol: String,
    pub tick_size: f64,
    pub initial_price: f64,
    pub initial_spread: f64,
    #[serde(default)]
    pub kind: InstrumentKind,
}

impl InstrumentConfig {
    pub fn instrument(&self) -> Instrument {
        Instrument {
            id: self.id,
            symbol: self.symbol.clone(),
            tick_size: Price::from_f64(self.tick_size),
            kind: self.kind.clone(),
        }
    }

    pub fn initial_price(&self) -> Price {
        Price::from_f64(self.initial_price)
    }

    pub fn initial_spread(&self) -> Price {
        Price::from_f64(self.initial_spread)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub tick_interval_ms: u64,
    pub updates_per_tick: usize,
    /// How often sockets and session timers are serviced.
    pub poll_interval_ms: u64,
    pub snapshot_interval_ms: u64,
    pub statistics_interval_ms: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig {
            tick_interval_ms: 100,
            updates_per_tick: 5,
            poll_interval_ms: 10,
            snapshot_interval_ms: 5_000,
            statistics_interval_ms: 10_000,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub generator: GeneratorConfig,
    pub cme: CmeConfig,
    pub reuters: ReutersConfig,
    pub schedule: ScheduleConfig,
    /// Falls back to [`default_instruments`] when empty.
    pub instruments: Vec<InstrumentConfig>,
}

impl FeedConfig {
    /// Layers defaults, `path` (if given; must exist when `required`) and the environment.
    pub fn load(path: Option<&Path>, required: bool) -> Result<Self, ConfigError> {
        let mut builder = ::config::Config::builder().add_source(::config::Config::try_from(&FeedConfig::default())?);
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(required));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let mut config: FeedConfig = builder.build()?.try_deserialize()?;
        if config.instruments.is_empty() {
            config.instruments = default_instruments();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = AHashSet::new();
        for inst in &self.instruments {
            if !seen.insert(inst.id) {
                return Err(ConfigError::DuplicateInstrument(inst.id));
            }
            if !(inst.tick_size > 0.0 && inst.initial_price > 0.0 && inst.initial_spread >= 0.0) {
                return Err(ConfigError::InvalidInstrument { symbol: inst.symbol.clone() });
            }
        }
        if self.schedule.tick_interval_ms == 0 {
            return Err(ConfigError::Zero("schedule.tick_interval_ms"));
        }
        if self.schedule.poll_interval_ms == 0 {
            return Err(ConfigError::Zero("schedule.poll_interval_ms"));
        }
        if self.schedule.snapshot_interval_ms == 0 {
            return Err(ConfigError::Zero("schedule.snapshot_interval_ms"));
        }
        if self.schedule.statistics_interval_ms == 0 {
            return Err(ConfigError::Zero("schedule.statistics_interval_ms"));
        }
        let max = crate::cme::schema::MAX_SNAPSHOT_DEPTH;
        if self.generator.snapshot_depth > max {
            return Err(ConfigError::SnapshotTooDeep { depth: self.generator.snapshot_depth, max });
        }
        if self.cme.batch_size == 0 {
            return Err(ConfigError::Zero("cme.batch_size"));
        }
        if self.cme.max_packet_bytes <= crate::cme::framer::PACKET_HEADER_LEN {
            return Err(ConfigError::PacketTooSmall(self.cme.max_packet_bytes));
        }
        if self.reuters.session_timeout_ms == 0 {
            return Err(ConfigError::Zero("reuters.session_timeout_ms"));
        }
        Ok(())
    }
}

pub fn default_instruments() -> Vec<InstrumentConfig> {
    vec![
        InstrumentConfig {
            id: 1,
            symbol: "ESZ5".into(),
            tick_size: 0.25,
            initial_price: 4500.0,
            initial_spread: 0.25,
            kind: InstrumentKind::Future { underlying: "ES".into(), maturity: 202512, contract_multiplier: 50 },
        },
        InstrumentConfig {
            id: 2,
            symbol: "NQZ5".into(),
            tick_size: 0.25,
            initial_price: 15800.0,
            initial_spread: 0.5,
            kind: InstrumentKind::Future { underlying: "NQ".into(), maturity: 202512, contract_multiplier: 20 },
        },
        InstrumentConfig {
            id: 3,
            symbol: "EUR/USD".into(),
            tick_size: 0.00001,
            initial_price: 1.085,
            initial_spread: 0.0001,
            kind: InstrumentKind::FxSpot { base_currency: "EUR".into(), quote_currency: "USD".into(), settlement_days: 2 },
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = FeedConfig::load(None, false).unwrap();
        assert_eq!(config.instruments.len(), 3);
        assert_eq!(config.cme.batch_size, 8);
        assert_eq!(config.cme.batcher().max_packet_bytes, 1420);
        assert_eq!(config.reuters.server(10).session_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("mdfeed-config-{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[cme]
batch_size = 4
enabled = false

[generator]
trade_probability = 0.5

[[reuters.credentials]]
username = "desk"
password = "pw"

[[instruments]]
id = 9
symbol = "CLF6"
tick_size = 0.01
initial_price = 70.5
initial_spread = 0.02
kind = {{ type = "future", underlying = "CL", maturity = 202601, contract_multiplier = 1000 }}
"#
        )
        .unwrap();

        let config = FeedConfig::load(Some(&path), true).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.cme.batch_size, 4);
        assert!(!config.cme.enabled);
        assert_eq!(config.cme.max_packet_bytes, 1420);
        assert_eq!(config.generator.trade_probability, 0.5);
        assert_eq!(config.reuters.credentials.len(), 1);
        assert_eq!(config.instruments.len(), 1);
        assert!(matches!(config.instruments[0].kind, InstrumentKind::Future { maturity: 202601, .. }));
    }

    #[test]
    fn test_missing_required_file_fails() {
        let path = Path::new("/nonexistent/mdfeed.toml");
        assert!(matches!(FeedConfig::load(Some(path), true), Err(ConfigError::Load(_))));
        assert!(FeedConfig::load(Some(path), false).is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = FeedConfig { instruments: default_instruments(), ..FeedConfig::default() };
        config.instruments[1].id = 1;
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateInstrument(1))));

        let mut config = FeedConfig { instruments: default_instruments(), ..FeedConfig::default() };
        config.instruments[0].tick_size = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidInstrument { .. })));

        let mut config = FeedConfig::default();
        config.cme.max_packet_bytes = 12;
        assert!(matches!(config.validate(), Err(ConfigError::PacketTooSmall(12))));

        let mut config = FeedConfig::default();
        config.generator.snapshot_depth = 200;
        assert!(matches!(config.validate(), Err(ConfigError::SnapshotTooDeep { depth: 200, max: 124 })));
        config.generator.snapshot_depth = 124;
        assert!(config.validate().is_ok());
    }
}
