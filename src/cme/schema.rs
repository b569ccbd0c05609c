//! Templates of the CME-style incremental and snapshot channels.

use crate::sbe::{FieldDef, FieldType, GroupDef, GroupHeader, Schema, TemplateDef};

pub const SCHEMA_ID: u16 = 1;
pub const SCHEMA_VERSION: u16 = 9;

pub const SECURITY_STATUS: u16 = 30;
pub const VOLUME: u16 = 37;
pub const BOOK_REFRESH: u16 = 46;
pub const TRADE_SUMMARY: u16 = 48;
pub const SESSION_STATISTICS: u16 = 51;
pub const SNAPSHOT_FULL_REFRESH: u16 = 52;

pub const ENTRIES: &str = "NoMDEntries";

/// Levels per side a full refresh can carry. Both sides and up to six statistics entries
/// share one compact group, which also keeps MDPriceLevel below its int8 null.
pub const MAX_SNAPSHOT_DEPTH: usize = (GroupHeader::Compact.max_entries() - 6) / 2;

// MDEntryType
pub const ENTRY_BID: &str = "0";
pub const ENTRY_OFFER: &str = "1";
pub const ENTRY_TRADE: &str = "2";
pub const ENTRY_OPEN: &str = "4";
pub const ENTRY_SETTLEMENT: &str = "6";
pub const ENTRY_HIGH: &str = "7";
pub const ENTRY_LOW: &str = "8";
pub const ENTRY_VWAP: &str = "9";
pub const ENTRY_VOLUME: &str = "e";

// MDUpdateAction
pub const ACTION_NEW: u8 = 0;
pub const ACTION_CHANGE: u8 = 1;
pub const ACTION_DELETE: u8 = 2;

// AggressorSide
pub const AGGRESSOR_BUY: u8 = 1;
pub const AGGRESSOR_SELL: u8 = 2;

// MatchEventIndicator bits
pub const MEI_LAST_TRADE: u8 = 0x01;
pub const MEI_LAST_QUOTE: u8 = 0x04;
pub const MEI_LAST_STATS: u8 = 0x08;
pub const MEI_END_OF_EVENT: u8 = 0x80;

const fn f(name: &'static str, offset: usize, ty: FieldType) -> FieldDef {
    FieldDef { name, offset, ty }
}

static TRANSACT_ROOT: [FieldDef; 2] = [
    f("TransactTime", 0, FieldType::U64),
    f("MatchEventIndicator", 8, FieldType::U8),
];

static BOOK_ENTRY: [FieldDef; 8] = [
    f("MDEntryPx", 0, FieldType::I64),
    f("MDEntrySize", 8, FieldType::I32),
    f("SecurityID", 12, FieldType::I32),
    f("RptSeq", 16, FieldType::U32),
    f("NumberOfOrders", 20, FieldType::I32),
    f("MDPriceLevel", 24, FieldType::U8),
    f("MDUpdateAction", 25, FieldType::U8),
    f("MDEntryType", 26, FieldType::Char(1)),
];

static TRADE_ENTRY: [FieldDef; 8] = [
    f("MDEntryPx", 0, FieldType::I64),
    f("MDEntrySize", 8, FieldType::I32),
    f("SecurityID", 12, FieldType::I32),
    f("RptSeq", 16, FieldType::U32),
    f("NumberOfOrders", 20, FieldType::I32),
    f("AggressorSide", 24, FieldType::U8),
    f("MDUpdateAction", 25, FieldType::U8),
    f("MDTradeEntryID", 26, FieldType::U32),
];

static STATS_ENTRY: [FieldDef; 7] = [
    f("MDEntryPx", 0, FieldType::I64),
    f("SecurityID", 8, FieldType::I32),
    f("RptSeq", 12, FieldType::U32),
    f("OpenCloseSettlFlag", 16, FieldType::U8),
    f("MDUpdateAction", 17, FieldType::U8),
    f("MDEntryType", 18, FieldType::Char(1)),
    f("MDEntrySize", 19, FieldType::I32),
];

static VOLUME_ENTRY: [FieldDef; 4] = [
    f("MDEntrySize", 0, FieldType::I32),
    f("SecurityID", 4, FieldType::I32),
    f("RptSeq", 8, FieldType::U32),
    f("MDUpdateAction", 12, FieldType::U8),
];

static STATUS_ROOT: [FieldDef; 9] = [
    f("TransactTime", 0, FieldType::U64),
    f("SecurityGroup", 8, FieldType::Char(6)),
    f("Asset", 14, FieldType::Char(6)),
    f("SecurityID", 20, FieldType::I32),
    f("TradeDate", 24, FieldType::U16),
    f("MatchEventIndicator", 26, FieldType::U8),
    f("SecurityTradingStatus", 27, FieldType::U8),
    f("HaltReason", 28, FieldType::U8),
    f("SecurityTradingEvent", 29, FieldType::U8),
];

static SNAPSHOT_ROOT: [FieldDef; 8] = [
    f("LastMsgSeqNumProcessed", 0, FieldType::U32),
    f("TotNumReports", 4, FieldType::U32),
    f("SecurityID", 8, FieldType::I32),
    f("RptSeq", 12, FieldType::U32),
    f("TransactTime", 16, FieldType::U64),
    f("LastUpdateTime", 24, FieldType::U64),
    f("TradeDate", 32, FieldType::U16),
    f("MDSecurityTradingStatus", 34, FieldType::U8),
];

static SNAPSHOT_ENTRY: [FieldDef; 5] = [
    f("MDEntryPx", 0, FieldType::I64),
    f("MDEntrySize", 8, FieldType::I32),
    f("NumberOfOrders", 12, FieldType::I32),
    f("MDPriceLevel", 16, FieldType::I8),
    f("MDEntryType", 17, FieldType::Char(1)),
];

static BOOK_GROUPS: [GroupDef; 1] = [GroupDef { name: ENTRIES, block_length: 32, fields: &BOOK_ENTRY }];
static TRADE_GROUPS: [GroupDef; 1] = [GroupDef { name: ENTRIES, block_length: 32, fields: &TRADE_ENTRY }];
static STATS_GROUPS: [GroupDef; 1] = [GroupDef { name: ENTRIES, block_length: 24, fields: &STATS_ENTRY }];
static VOLUME_GROUPS: [GroupDef; 1] = [GroupDef { name: ENTRIES, block_length: 16, fields: &VOLUME_ENTRY }];
static SNAPSHOT_GROUPS: [GroupDef; 1] =
    [GroupDef { name: ENTRIES, block_length: 22, fields: &SNAPSHOT_ENTRY }];

static TEMPLATES: [TemplateDef; 6] = [
    TemplateDef { id: SECURITY_STATUS, name: "SecurityStatus", block_length: 30, fields: &STATUS_ROOT, groups: &[] },
    TemplateDef { id: VOLUME, name: "MDIncrementalRefreshVolume", block_length: 11, fields: &TRANSACT_ROOT, groups: &VOLUME_GROUPS },
    TemplateDef { id: BOOK_REFRESH, name: "MDIncrementalRefreshBook", block_length: 11, fields: &TRANSACT_ROOT, groups: &BOOK_GROUPS },
    TemplateDef { id: TRADE_SUMMARY, name: "MDIncrementalRefreshTradeSummary", block_length: 11, fields: &TRANSACT_ROOT, groups: &TRADE_GROUPS },
    TemplateDef { id: SESSION_STATISTICS, name: "MDIncrementalRefreshSessionStatistics", block_length: 11, fields: &TRANSACT_ROOT, groups: &STATS_GROUPS },
    TemplateDef { id: SNAPSHOT_FULL_REFRESH, name: "SnapshotFullRefresh", block_length: 35, fields: &SNAPSHOT_ROOT, groups: &SNAPSHOT_GROUPS },
];

pub static SCHEMA: Schema = Schema {
    id: SCHEMA_ID,
    version: SCHEMA_VERSION,
    group_header: GroupHeader::Compact,
    templates: &TEMPLATES,
};
