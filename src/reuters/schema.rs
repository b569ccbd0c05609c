//! Templates of the Reuters-style session feed: session-layer handshake messages
//! (500 series) and the application messages carried once established.

use crate::sbe::{FieldDef, FieldType, GroupDef, GroupHeader, Schema, TemplateDef};

pub const SCHEMA_ID: u16 = 101;
pub const SCHEMA_VERSION: u16 = 1;

pub const MARKET_DATA_REQUEST: u16 = 1;
pub const SECURITY_DEFINITION_REQUEST: u16 = 2;
pub const SNAPSHOT_FULL_REFRESH: u16 = 10;
pub const INCREMENTAL_REFRESH: u16 = 11;
pub const SECURITY_DEFINITION: u16 = 12;
pub const MARKET_DATA_REQUEST_REJECT: u16 = 13;
pub const SECURITY_STATUS: u16 = 15;

pub const NEGOTIATE: u16 = 500;
pub const NEGOTIATION_RESPONSE: u16 = 501;
pub const NEGOTIATION_REJECT: u16 = 502;
pub const ESTABLISH: u16 = 503;
pub const ESTABLISHMENT_ACK: u16 = 504;
pub const ESTABLISHMENT_REJECT: u16 = 505;
pub const SEQUENCE: u16 = 506;
pub const TERMINATE: u16 = 507;

pub const RELATED_SYM: &str = "NoRelatedSym";
pub const MD_ENTRIES: &str = "NoMDEntries";

pub const USERNAME_LEN: usize = 16;
pub const REASON_LEN: usize = 32;
pub const SYMBOL_LEN: usize = 24;

const fn f(name: &'static str, offset: usize, ty: FieldType) -> FieldDef {
    FieldDef { name, offset, ty }
}

static NEGOTIATE_ROOT: [FieldDef; 5] = [
    f("UUID", 0, FieldType::U64),
    f("Timestamp", 8, FieldType::U64),
    f("ClientFlow", 16, FieldType::U8),
    f("Username", 17, FieldType::Char(USERNAME_LEN)),
    f("Password", 33, FieldType::Char(USERNAME_LEN)),
];

static NEGOTIATION_RESPONSE_ROOT: [FieldDef; 3] = [
    f("UUID", 0, FieldType::U64),
    f("RequestTimestamp", 8, FieldType::U64),
    f("ServerFlow", 16, FieldType::U8),
];

// NegotiationReject, EstablishmentReject and Terminate share a layout.
static REJECT_ROOT: [FieldDef; 4] = [
    f("UUID", 0, FieldType::U64),
    f("RequestTimestamp", 8, FieldType::U64),
    f("Code", 16, FieldType::U8),
    f("Reason", 17, FieldType::Char(REASON_LEN)),
];

static ESTABLISH_ROOT: [FieldDef; 4] = [
    f("UUID", 0, FieldType::U64),
    f("Timestamp", 8, FieldType::U64),
    f("KeepaliveInterval", 16, FieldType::U32),
    f("NextSeqNo", 20, FieldType::U64),
];

static ESTABLISHMENT_ACK_ROOT: [FieldDef; 4] = [
    f("UUID", 0, FieldType::U64),
    f("RequestTimestamp", 8, FieldType::U64),
    f("KeepaliveInterval", 16, FieldType::U32),
    f("NextSeqNo", 20, FieldType::U64),
];

static SEQUENCE_ROOT: [FieldDef; 2] = [f("UUID", 0, FieldType::U64), f("NextSeqNo", 8, FieldType::U64)];

static MD_REQUEST_ROOT: [FieldDef; 3] = [
    f("MDReqID", 0, FieldType::U32),
    f("SubscriptionRequestType", 4, FieldType::U8),
    f("MarketDepth", 5, FieldType::U8),
];

static SECDEF_REQUEST_ROOT: [FieldDef; 1] = [f("SecurityReqID", 0, FieldType::U32)];

static RELATED_SYM_ENTRY: [FieldDef; 1] = [f("SecurityID", 0, FieldType::U32)];

static SNAPSHOT_ROOT: [FieldDef; 6] = [
    f("SeqNum", 0, FieldType::U64),
    f("TransactTime", 8, FieldType::U64),
    f("SecurityID", 16, FieldType::U32),
    f("RptSeq", 20, FieldType::U32),
    f("SecurityTradingStatus", 24, FieldType::U8),
    f("MDReqID", 25, FieldType::U32),
];

static SNAPSHOT_ENTRY: [FieldDef; 5] = [
    f("MDEntryType", 0, FieldType::Char(1)),
    f("MDEntryPx", 1, FieldType::I64),
    f("MDEntrySize", 9, FieldType::U64),
    f("NumberOfOrders", 17, FieldType::U32),
    f("MDPriceLevel", 21, FieldType::U8),
];

static INCREMENTAL_ROOT: [FieldDef; 2] = [f("SeqNum", 0, FieldType::U64), f("TransactTime", 8, FieldType::U64)];

static INCREMENTAL_ENTRY: [FieldDef; 10] = [
    f("SecurityID", 0, FieldType::U32),
    f("RptSeq", 4, FieldType::U32),
    f("MDUpdateAction", 8, FieldType::U8),
    f("MDEntryType", 9, FieldType::Char(1)),
    f("MDEntryPx", 10, FieldType::I64),
    f("MDEntrySize", 18, FieldType::U64),
    f("NumberOfOrders", 26, FieldType::U32),
    f("MDPriceLevel", 30, FieldType::U8),
    f("AggressorSide", 31, FieldType::U8),
    f("TradeID", 32, FieldType::U32),
];

static SECURITY_DEFINITION_ROOT: [FieldDef; 12] = [
    f("SeqNum", 0, FieldType::U64),
    f("SecurityReqID", 8, FieldType::U32),
    f("SecurityID", 12, FieldType::U32),
    f("Symbol", 16, FieldType::Char(SYMBOL_LEN)),
    f("SecurityType", 40, FieldType::Char(8)),
    f("MinPriceIncrement", 48, FieldType::I64),
    f("Underlying", 56, FieldType::Char(8)),
    f("Currency", 64, FieldType::Char(4)),
    f("MaturityMonthYear", 68, FieldType::U32),
    f("ContractMultiplier", 72, FieldType::U32),
    f("SettlementDays", 76, FieldType::U8),
    f("TotNumReports", 77, FieldType::U32),
];

static MD_REQUEST_REJECT_ROOT: [FieldDef; 4] = [
    f("SeqNum", 0, FieldType::U64),
    f("MDReqID", 8, FieldType::U32),
    f("MDReqRejReason", 12, FieldType::U8),
    f("Text", 13, FieldType::Char(REASON_LEN)),
];

static SECURITY_STATUS_ROOT: [FieldDef; 5] = [
    f("SeqNum", 0, FieldType::U64),
    f("TransactTime", 8, FieldType::U64),
    f("SecurityID", 16, FieldType::U32),
    f("RptSeq", 20, FieldType::U32),
    f("SecurityTradingStatus", 24, FieldType::U8),
];

static RELATED_SYM_GROUPS: [GroupDef; 1] =
    [GroupDef { name: RELATED_SYM, block_length: 4, fields: &RELATED_SYM_ENTRY }];
static SNAPSHOT_GROUPS: [GroupDef; 1] = [GroupDef { name: MD_ENTRIES, block_length: 22, fields: &SNAPSHOT_ENTRY }];
static INCREMENTAL_GROUPS: [GroupDef; 1] =
    [GroupDef { name: MD_ENTRIES, block_length: 36, fields: &INCREMENTAL_ENTRY }];

static TEMPLATES: [TemplateDef; 15] = [
    TemplateDef { id: MARKET_DATA_REQUEST, name: "MarketDataRequest", block_length: 6, fields: &MD_REQUEST_ROOT, groups: &RELATED_SYM_GROUPS },
    TemplateDef { id: SECURITY_DEFINITION_REQUEST, name: "SecurityDefinitionRequest", block_length: 4, fields: &SECDEF_REQUEST_ROOT, groups: &RELATED_SYM_GROUPS },
    TemplateDef { id: SNAPSHOT_FULL_REFRESH, name: "MarketDataSnapshotFullRefresh", block_length: 29, fields: &SNAPSHOT_ROOT, groups: &SNAPSHOT_GROUPS },
    TemplateDef { id: INCREMENTAL_REFRESH, name: "MarketDataIncrementalRefresh", block_length: 16, fields: &INCREMENTAL_ROOT, groups: &INCREMENTAL_GROUPS },
    TemplateDef { id: SECURITY_DEFINITION, name: "SecurityDefinition", block_length: 81, fields: &SECURITY_DEFINITION_ROOT, groups: &[] },
    TemplateDef { id: MARKET_DATA_REQUEST_REJECT, name: "MarketDataRequestReject", block_length: 45, fields: &MD_REQUEST_REJECT_ROOT, groups: &[] },
    TemplateDef { id: SECURITY_STATUS, name: "SecurityStatus", block_length: 25, fields: &SECURITY_STATUS_ROOT, groups: &[] },
    TemplateDef { id: NEGOTIATE, name: "Negotiate", block_length: 49, fields: &NEGOTIATE_ROOT, groups: &[] },
    TemplateDef { id: NEGOTIATION_RESPONSE, name: "NegotiationResponse", block_length: 17, fields: &NEGOTIATION_RESPONSE_ROOT, groups: &[] },
    TemplateDef { id: NEGOTIATION_REJECT, name: "NegotiationReject", block_length: 49, fields: &REJECT_ROOT, groups: &[] },
    TemplateDef { id: ESTABLISH, name: "Establish", block_length: 28, fields: &ESTABLISH_ROOT, groups: &[] },
    TemplateDef { id: ESTABLISHMENT_ACK, name: "EstablishmentAck", block_length: 28, fields: &ESTABLISHMENT_ACK_ROOT, groups: &[] },
    TemplateDef { id: ESTABLISHMENT_REJECT, name: "EstablishmentReject", block_length: 49, fields: &REJECT_ROOT, groups: &[] },
    TemplateDef { id: SEQUENCE, name: "Sequence", block_length: 16, fields: &SEQUENCE_ROOT, groups: &[] },
    TemplateDef { id: TERMINATE, name: "Terminate", block_length: 49, fields: &REJECT_ROOT, groups: &[] },
];

pub static SCHEMA: Schema = Schema {
    id: SCHEMA_ID,
    version: SCHEMA_VERSION,
    group_header: GroupHeader::Standard,
    templates: &TEMPLATES,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_fit_their_blocks() {
        for t in SCHEMA.templates {
            let max_end = t.fields.iter().map(|f| f.offset + f.ty.size()).max().unwrap_or(0);
            assert_eq!(max_end, t.block_length as usize, "{}", t.name);
            for g in t.groups {
                let end = g.fields.iter().map(|f| f.offset + f.ty.size()).max().unwrap_or(0);
                assert_eq!(end, g.block_length as usize, "{}.{}", t.name, g.name);
            }
        }
    }
}
