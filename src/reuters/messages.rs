// Typed session and application messages. Everything goes through the SBE codec;
// nothing here touches payload bytes directly.

use bytes::Bytes;

use super::schema::*;
use crate::engine::types::{Instrument, InstrumentId, InstrumentKind, LevelChange, Price, Side, TradingStatus};
use crate::sbe::{CodecError, DecodedMessage, MessageEncoder, Value, NULL_I64};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MessageError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("template {0} is not accepted from clients")]
    UnexpectedTemplate(u16),
    #[error("field `{field}` has invalid value {value}")]
    InvalidValue { field: &'static str, value: u64 },
}

macro_rules! code_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:expr),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant = $value),*
        }

        impl $name {
            pub fn code(self) -> u8 {
                self as u8
            }

            pub fn from_code(code: u8) -> Option<Self> {
                match code {
                    $(v if v == $value => Some($name::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

code_enum!(
    /// Delivery guarantee a party requests for its outbound flow.
    FlowType { Idempotent = 0, Recoverable = 1, Unsequenced = 2, NoFlow = 3 }
);

code_enum!(TerminationCode {
    Finished = 0,
    Unspecified = 1,
    ProtocolViolation = 2,
    AuthenticationFailed = 3,
    KeepaliveTimeout = 4,
    AdminShutdown = 5,
});

code_enum!(RejectCode {
    Unspecified = 0,
    Credentials = 1,
    AlreadyNegotiated = 2,
    NotNegotiated = 3,
    InvalidKeepalive = 4,
});

code_enum!(SubscriptionType { Snapshot = 0, Subscribe = 1, Unsubscribe = 2 });

code_enum!(MdRejectReason { UnknownInstrument = 0 });

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MdEntryType {
    Bid,
    Offer,
    Trade,
    Open,
    Settlement,
    High,
    Low,
    Vwap,
    Volume,
}

impl MdEntryType {
    pub fn as_str(self) -> &'static str {
        match self {
            MdEntryType::Bid => "0",
            MdEntryType::Offer => "1",
            MdEntryType::Trade => "2",
            MdEntryType::Open => "4",
            MdEntryType::Settlement => "6",
            MdEntryType::High => "7",
            MdEntryType::Low => "8",
            MdEntryType::Vwap => "9",
            MdEntryType::Volume => "e",
        }
    }

    pub fn for_side(side: Side) -> Self {
        match side {
            Side::Buy => MdEntryType::Bid,
            Side::Sell => MdEntryType::Offer,
        }
    }
}

/// Messages a client may send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Negotiate { uuid: u64, timestamp: u64, flow: FlowType, username: String, password: String },
    Establish { uuid: u64, timestamp: u64, keepalive_ms: u32, next_seq_no: u64 },
    Sequence { uuid: u64, next_seq_no: u64 },
    Terminate { uuid: u64, code: TerminationCode, reason: String },
    MarketDataRequest { request_id: u32, subscription: SubscriptionType, depth: u8, instruments: Vec<InstrumentId> },
    SecurityDefinitionRequest { request_id: u32, instruments: Vec<InstrumentId> },
}

fn get_u64(msg: &DecodedMessage<'_>, field: &'static str) -> Result<u64, MessageError> {
    msg.get(field)?.as_u64().ok_or(MessageError::InvalidValue { field, value: 0 })
}

fn get_u8(msg: &DecodedMessage<'_>, field: &'static str) -> Result<u8, MessageError> {
    let v = get_u64(msg, field)?;
    u8::try_from(v).map_err(|_| MessageError::InvalidValue { field, value: v })
}

fn get_u32(msg: &DecodedMessage<'_>, field: &'static str) -> Result<u32, MessageError> {
    let v = get_u64(msg, field)?;
    u32::try_from(v).map_err(|_| MessageError::InvalidValue { field, value: v })
}

fn get_str(msg: &DecodedMessage<'_>, field: &'static str) -> Result<String, MessageError> {
    match msg.get(field)? {
        Value::Str(s) => Ok(s),
        _ => Err(MessageError::InvalidValue { field, value: 0 }),
    }
}

fn decode_code<T>(msg: &DecodedMessage<'_>, field: &'static str, f: impl Fn(u8) -> Option<T>) -> Result<T, MessageError> {
    let code = get_u8(msg, field)?;
    f(code).ok_or(MessageError::InvalidValue { field, value: u64::from(code) })
}

fn related_instruments(msg: &DecodedMessage<'_>) -> Result<Vec<InstrumentId>, MessageError> {
    (0..msg.group_len(RELATED_SYM)?)
        .map(|i| {
            let v = msg.entry_field(RELATED_SYM, i, "SecurityID")?;
            v.as_u64()
                .and_then(|id| u32::try_from(id).ok())
                .ok_or(MessageError::InvalidValue { field: "SecurityID", value: 0 })
        })
        .collect()
}

fn add_related(enc: &mut MessageEncoder, instruments: &[InstrumentId]) -> Result<(), CodecError> {
    for id in instruments {
        let e = enc.add_entry(RELATED_SYM)?;
        enc.set_entry_field(RELATED_SYM, e, "SecurityID", *id)?;
    }
    Ok(())
}

/// Longest prefix of `text` that fits a fixed-width ASCII field.
fn fit(text: &str, len: usize) -> String {
    text.chars().filter(char::is_ascii).take(len).collect()
}

impl Inbound {
    pub fn decode(payload: &[u8]) -> Result<Self, MessageError> {
        let msg = DecodedMessage::decode(&SCHEMA, payload)?;
        let inbound = match msg.template_id() {
            NEGOTIATE => Inbound::Negotiate {
                uuid: get_u64(&msg, "UUID")?,
                timestamp: get_u64(&msg, "Timestamp")?,
                flow: decode_code(&msg, "ClientFlow", FlowType::from_code)?,
                username: get_str(&msg, "Username")?,
                password: get_str(&msg, "Password")?,
            },
            ESTABLISH => Inbound::Establish {
                uuid: get_u64(&msg, "UUID")?,
                timestamp: get_u64(&msg, "Timestamp")?,
                keepalive_ms: get_u32(&msg, "KeepaliveInterval")?,
                next_seq_no: get_u64(&msg, "NextSeqNo")?,
            },
            SEQUENCE => Inbound::Sequence { uuid: get_u64(&msg, "UUID")?, next_seq_no: get_u64(&msg, "NextSeqNo")? },
            TERMINATE => Inbound::Terminate {
                uuid: get_u64(&msg, "UUID")?,
                code: decode_code(&msg, "Code", TerminationCode::from_code)?,
                reason: get_str(&msg, "Reason")?,
            },
            MARKET_DATA_REQUEST => Inbound::MarketDataRequest {
                request_id: get_u32(&msg, "MDReqID")?,
                subscription: decode_code(&msg, "SubscriptionRequestType", SubscriptionType::from_code)?,
                depth: get_u8(&msg, "MarketDepth")?,
                instruments: related_instruments(&msg)?,
            },
            SECURITY_DEFINITION_REQUEST => Inbound::SecurityDefinitionRequest {
                request_id: get_u32(&msg, "SecurityReqID")?,
                instruments: related_instruments(&msg)?,
            },
            other => return Err(MessageError::UnexpectedTemplate(other)),
        };
        Ok(inbound)
    }

    /// Client-side encoding.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let enc = match self {
            Inbound::Negotiate { uuid, timestamp, flow, username, password } => {
                let mut enc = MessageEncoder::new(&SCHEMA, NEGOTIATE)?;
                enc.set_field("UUID", *uuid)?;
                enc.set_field("Timestamp", *timestamp)?;
                enc.set_field("ClientFlow", flow.code())?;
                enc.set_field("Username", username.as_str())?;
                enc.set_field("Password", password.as_str())?;
                enc
            }
            Inbound::Establish { uuid, timestamp, keepalive_ms, next_seq_no } => {
                let mut enc = MessageEncoder::new(&SCHEMA, ESTABLISH)?;
                enc.set_field("UUID", *uuid)?;
                enc.set_field("Timestamp", *timestamp)?;
                enc.set_field("KeepaliveInterval", *keepalive_ms)?;
                enc.set_field("NextSeqNo", *next_seq_no)?;
                enc
            }
            Inbound::Sequence { uuid, next_seq_no } => {
                let mut enc = MessageEncoder::new(&SCHEMA, SEQUENCE)?;
                enc.set_field("UUID", *uuid)?;
                enc.set_field("NextSeqNo", *next_seq_no)?;
                enc
            }
            Inbound::Terminate { uuid, code, reason } => {
                let mut enc = MessageEncoder::new(&SCHEMA, TERMINATE)?;
                enc.set_field("UUID", *uuid)?;
                enc.set_field("Code", code.code())?;
                enc.set_field("Reason", fit(reason, REASON_LEN))?;
                enc
            }
            Inbound::MarketDataRequest { request_id, subscription, depth, instruments } => {
                let mut enc = MessageEncoder::new(&SCHEMA, MARKET_DATA_REQUEST)?;
                enc.set_field("MDReqID", *request_id)?;
                enc.set_field("SubscriptionRequestType", subscription.code())?;
                enc.set_field("MarketDepth", *depth)?;
                add_related(&mut enc, instruments)?;
                enc
            }
            Inbound::SecurityDefinitionRequest { request_id, instruments } => {
                let mut enc = MessageEncoder::new(&SCHEMA, SECURITY_DEFINITION_REQUEST)?;
                enc.set_field("SecurityReqID", *request_id)?;
                add_related(&mut enc, instruments)?;
                enc
            }
        };
        Ok(enc.encode())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Inbound::Negotiate { .. } => "Negotiate",
            Inbound::Establish { .. } => "Establish",
            Inbound::Sequence { .. } => "Sequence",
            Inbound::Terminate { .. } => "Terminate",
            Inbound::MarketDataRequest { .. } => "MarketDataRequest",
            Inbound::SecurityDefinitionRequest { .. } => "SecurityDefinitionRequest",
        }
    }
}

/// One level or statistic in a full refresh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub entry_type: MdEntryType,
    pub price: Option<Price>,
    pub size: u64,
    pub order_count: u32,
    /// 1-based book position; zero for statistics.
    pub level: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IncrementalEntry {
    pub instrument_id: InstrumentId,
    pub rpt_seq: u32,
    pub action: LevelChange,
    pub entry_type: MdEntryType,
    pub price: Option<Price>,
    pub size: u64,
    pub order_count: u32,
    pub level: u8,
    pub aggressor: Option<Side>,
    pub trade_id: u32,
}

/// Messages the server sends. Application messages carry the session's outbound
/// sequence number in `seq`.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    NegotiationResponse { uuid: u64, request_timestamp: u64 },
    NegotiationReject { uuid: u64, request_timestamp: u64, code: RejectCode, reason: String },
    EstablishmentAck { uuid: u64, request_timestamp: u64, keepalive_ms: u32, next_seq_no: u64 },
    EstablishmentReject { uuid: u64, request_timestamp: u64, code: RejectCode, reason: String },
    Sequence { uuid: u64, next_seq_no: u64 },
    Terminate { uuid: u64, code: TerminationCode, reason: String },
    SnapshotFullRefresh {
        seq: u64,
        request_id: u32,
        instrument_id: InstrumentId,
        rpt_seq: u32,
        timestamp: u64,
        status: TradingStatus,
        entries: Vec<SnapshotEntry>,
    },
    IncrementalRefresh { seq: u64, timestamp: u64, entries: Vec<IncrementalEntry> },
    SecurityDefinition { seq: u64, request_id: u32, total: u32, instrument: Instrument },
    MarketDataRequestReject { seq: u64, request_id: u32, reason: MdRejectReason, text: String },
    SecurityStatus { seq: u64, instrument_id: InstrumentId, rpt_seq: u32, timestamp: u64, status: TradingStatus },
}

fn price_mantissa(price: Option<Price>) -> i64 {
    price.map(Price::mantissa).unwrap_or(NULL_I64)
}

fn side_code(side: Option<Side>) -> u8 {
    match side {
        None => 0,
        Some(Side::Buy) => 1,
        Some(Side::Sell) => 2,
    }
}

fn action_code(action: LevelChange) -> u8 {
    match action {
        LevelChange::New => 0,
        LevelChange::Change => 1,
        LevelChange::Delete => 2,
    }
}

impl Outbound {
    /// True for messages that consume an outbound sequence number.
    pub fn is_application(&self) -> bool {
        matches!(
            self,
            Outbound::SnapshotFullRefresh { .. }
                | Outbound::IncrementalRefresh { .. }
                | Outbound::SecurityDefinition { .. }
                | Outbound::MarketDataRequestReject { .. }
                | Outbound::SecurityStatus { .. }
        )
    }

    pub fn template_id(&self) -> u16 {
        match self {
            Outbound::NegotiationResponse { .. } => NEGOTIATION_RESPONSE,
            Outbound::NegotiationReject { .. } => NEGOTIATION_REJECT,
            Outbound::EstablishmentAck { .. } => ESTABLISHMENT_ACK,
            Outbound::EstablishmentReject { .. } => ESTABLISHMENT_REJECT,
            Outbound::Sequence { .. } => SEQUENCE,
            Outbound::Terminate { .. } => TERMINATE,
            Outbound::SnapshotFullRefresh { .. } => SNAPSHOT_FULL_REFRESH,
            Outbound::IncrementalRefresh { .. } => INCREMENTAL_REFRESH,
            Outbound::SecurityDefinition { .. } => SECURITY_DEFINITION,
            Outbound::MarketDataRequestReject { .. } => MARKET_DATA_REQUEST_REJECT,
            Outbound::SecurityStatus { .. } => SECURITY_STATUS,
        }
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut enc = MessageEncoder::new(&SCHEMA, self.template_id())?;
        match self {
            Outbound::NegotiationResponse { uuid, request_timestamp } => {
                enc.set_field("UUID", *uuid)?;
                enc.set_field("RequestTimestamp", *request_timestamp)?;
                enc.set_field("ServerFlow", FlowType::Idempotent.code())?;
            }
            Outbound::NegotiationReject { uuid, request_timestamp, code, reason }
            | Outbound::EstablishmentReject { uuid, request_timestamp, code, reason } => {
                enc.set_field("UUID", *uuid)?;
                enc.set_field("RequestTimestamp", *request_timestamp)?;
                enc.set_field("Code", code.code())?;
                enc.set_field("Reason", fit(reason, REASON_LEN))?;
            }
            Outbound::EstablishmentAck { uuid, request_timestamp, keepalive_ms, next_seq_no } => {
                enc.set_field("UUID", *uuid)?;
                enc.set_field("RequestTimestamp", *request_timestamp)?;
                enc.set_field("KeepaliveInterval", *keepalive_ms)?;
                enc.set_field("NextSeqNo", *next_seq_no)?;
            }
            Outbound::Sequence { uuid, next_seq_no } => {
                enc.set_field("UUID", *uuid)?;
                enc.set_field("NextSeqNo", *next_seq_no)?;
            }
            Outbound::Terminate { uuid, code, reason } => {
                enc.set_field("UUID", *uuid)?;
                enc.set_field("Code", code.code())?;
                enc.set_field("Reason", fit(reason, REASON_LEN))?;
            }
            Outbound::SnapshotFullRefresh { seq, request_id, instrument_id, rpt_seq, timestamp, status, entries } => {
                enc.set_field("SeqNum", *seq)?;
                enc.set_field("TransactTime", *timestamp)?;
                enc.set_field("SecurityID", *instrument_id)?;
                enc.set_field("RptSeq", *rpt_seq)?;
                enc.set_field("SecurityTradingStatus", *status as u8)?;
                enc.set_field("MDReqID", *request_id)?;
                for entry in entries {
                    let e = enc.add_entry(MD_ENTRIES)?;
                    enc.set_entry_field(MD_ENTRIES, e, "MDEntryType", entry.entry_type.as_str())?;
                    enc.set_entry_field(MD_ENTRIES, e, "MDEntryPx", price_mantissa(entry.price))?;
                    enc.set_entry_field(MD_ENTRIES, e, "MDEntrySize", entry.size)?;
                    enc.set_entry_field(MD_ENTRIES, e, "NumberOfOrders", entry.order_count)?;
                    enc.set_entry_field(MD_ENTRIES, e, "MDPriceLevel", entry.level)?;
                }
            }
            Outbound::IncrementalRefresh { seq, timestamp, entries } => {
                enc.set_field("SeqNum", *seq)?;
                enc.set_field("TransactTime", *timestamp)?;
                for entry in entries {
                    let e = enc.add_entry(MD_ENTRIES)?;
                    enc.set_entry_field(MD_ENTRIES, e, "SecurityID", entry.instrument_id)?;
                    enc.set_entry_field(MD_ENTRIES, e, "RptSeq", entry.rpt_seq)?;
                    enc.set_entry_field(MD_ENTRIES, e, "MDUpdateAction", action_code(entry.action))?;
                    enc.set_entry_field(MD_ENTRIES, e, "MDEntryType", entry.entry_type.as_str())?;
                    enc.set_entry_field(MD_ENTRIES, e, "MDEntryPx", price_mantissa(entry.price))?;
                    enc.set_entry_field(MD_ENTRIES, e, "MDEntrySize", entry.size)?;
                    enc.set_entry_field(MD_ENTRIES, e, "NumberOfOrders", entry.order_count)?;
                    enc.set_entry_field(MD_ENTRIES, e, "MDPriceLevel", entry.level)?;
                    enc.set_entry_field(MD_ENTRIES, e, "AggressorSide", side_code(entry.aggressor))?;
                    enc.set_entry_field(MD_ENTRIES, e, "TradeID", entry.trade_id)?;
                }
            }
            Outbound::SecurityDefinition { seq, request_id, total, instrument } => {
                enc.set_field("SeqNum", *seq)?;
                enc.set_field("SecurityReqID", *request_id)?;
                enc.set_field("SecurityID", instrument.id)?;
                enc.set_field("Symbol", fit(&instrument.symbol, SYMBOL_LEN))?;
                enc.set_field("MinPriceIncrement", instrument.tick_size.mantissa())?;
                enc.set_field("TotNumReports", *total)?;
                match &instrument.kind {
                    InstrumentKind::Future { underlying, maturity, contract_multiplier } => {
                        enc.set_field("SecurityType", "FUT")?;
                        enc.set_field("Underlying", fit(underlying, 8))?;
                        enc.set_field("MaturityMonthYear", *maturity)?;
                        enc.set_field("ContractMultiplier", *contract_multiplier)?;
                    }
                    InstrumentKind::FxSpot { base_currency, quote_currency, settlement_days } => {
                        enc.set_field("SecurityType", "FXSPOT")?;
                        enc.set_field("Underlying", fit(base_currency, 8))?;
                        enc.set_field("Currency", fit(quote_currency, 4))?;
                        enc.set_field("SettlementDays", *settlement_days)?;
                    }
                    InstrumentKind::Generic { .. } => {
                        enc.set_field("SecurityType", "GENERIC")?;
                    }
                }
            }
            Outbound::MarketDataRequestReject { seq, request_id, reason, text } => {
                enc.set_field("SeqNum", *seq)?;
                enc.set_field("MDReqID", *request_id)?;
                enc.set_field("MDReqRejReason", reason.code())?;
                enc.set_field("Text", fit(text, REASON_LEN))?;
            }
            Outbound::SecurityStatus { seq, instrument_id, rpt_seq, timestamp, status } => {
                enc.set_field("SeqNum", *seq)?;
                enc.set_field("TransactTime", *timestamp)?;
                enc.set_field("SecurityID", *instrument_id)?;
                enc.set_field("RptSeq", *rpt_seq)?;
                enc.set_field("SecurityTradingStatus", *status as u8)?;
            }
        }
        Ok(enc.encode())
    }
}
