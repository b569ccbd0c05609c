//! Schema-driven Simple Binary Encoding codec.
//!
//! Templates are described by static tables ([`TemplateDef`], [`FieldDef`], [`GroupDef`]).
//! Protocol code sets named fields on a [`MessageEncoder`] and never touches payload bytes;
//! [`DecodedMessage`] reads them back. All integers are little-endian.
//!
//! Layout of an encoded message:
//!
//! ```text
//! message header (8) | root block (blockLength) | for each group: group header, entries
//! ```

use bytes::{BufMut, Bytes, BytesMut};

pub const MESSAGE_HEADER_LEN: usize = 8;

pub const NULL_U8: u8 = u8::MAX;
pub const NULL_I8: i8 = i8::MAX;
pub const NULL_U32: u32 = u32::MAX;
pub const NULL_I32: i32 = i32::MAX;
pub const NULL_I64: i64 = i64::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I32,
    I64,
    /// Fixed-width ASCII, zero padded.
    Char(usize),
}

impl FieldType {
    pub const fn size(self) -> usize {
        match self {
            FieldType::U8 | FieldType::I8 => 1,
            FieldType::U16 => 2,
            FieldType::U32 | FieldType::I32 => 4,
            FieldType::U64 | FieldType::I64 => 8,
            FieldType::Char(len) => len,
        }
    }

    fn range(self) -> Option<(i128, i128)> {
        match self {
            FieldType::U8 => Some((0, u8::MAX as i128)),
            FieldType::U16 => Some((0, u16::MAX as i128)),
            FieldType::U32 => Some((0, u32::MAX as i128)),
            FieldType::U64 => Some((0, u64::MAX as i128)),
            FieldType::I8 => Some((i8::MIN as i128, i8::MAX as i128)),
            FieldType::I32 => Some((i32::MIN as i128, i32::MAX as i128)),
            FieldType::I64 => Some((i64::MIN as i128, i64::MAX as i128)),
            FieldType::Char(_) => None,
        }
    }
}

#[derive(Debug)]
pub struct FieldDef {
    pub name: &'static str,
    pub offset: usize,
    pub ty: FieldType,
}

#[derive(Debug)]
pub struct GroupDef {
    pub name: &'static str,
    pub block_length: u16,
    pub fields: &'static [FieldDef],
}

#[derive(Debug)]
pub struct TemplateDef {
    pub id: u16,
    pub name: &'static str,
    pub block_length: u16,
    pub fields: &'static [FieldDef],
    pub groups: &'static [GroupDef],
}

impl TemplateDef {
    fn field(&self, name: &str) -> Result<&'static FieldDef, CodecError> {
        find_field(self.fields, name).ok_or_else(|| CodecError::UnknownField {
            template: self.name,
            field: name.to_string(),
        })
    }

    fn group_index(&self, name: &str) -> Result<usize, CodecError> {
        self.groups.iter().position(|g| g.name == name).ok_or_else(|| CodecError::UnknownGroup {
            template: self.name,
            group: name.to_string(),
        })
    }
}

fn find_field(fields: &'static [FieldDef], name: &str) -> Option<&'static FieldDef> {
    fields.iter().find(|f| f.name == name)
}

/// Encoding of the repeating-group dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupHeader {
    /// `u16` blockLength, `u8` numInGroup.
    Compact,
    /// `u16` blockLength, `u16` numInGroup.
    Standard,
}

impl GroupHeader {
    pub const fn len(self) -> usize {
        match self {
            GroupHeader::Compact => 3,
            GroupHeader::Standard => 4,
        }
    }

    pub const fn max_entries(self) -> usize {
        match self {
            GroupHeader::Compact => u8::MAX as usize,
            GroupHeader::Standard => u16::MAX as usize,
        }
    }
}

#[derive(Debug)]
pub struct Schema {
    pub id: u16,
    pub version: u16,
    pub group_header: GroupHeader,
    pub templates: &'static [TemplateDef],
}

impl Schema {
    pub fn template(&self, id: u16) -> Result<&TemplateDef, CodecError> {
        self.templates.iter().find(|t| t.id == id).ok_or(CodecError::UnknownTemplate(id))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub block_length: u16,
    pub template_id: u16,
    pub schema_id: u16,
    pub version: u16,
}

impl MessageHeader {
    pub fn read(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < MESSAGE_HEADER_LEN {
            return Err(CodecError::Truncated { needed: MESSAGE_HEADER_LEN, available: buf.len() });
        }
        Ok(MessageHeader {
            block_length: read_u16(buf, 0),
            template_id: read_u16(buf, 2),
            schema_id: read_u16(buf, 4),
            version: read_u16(buf, 6),
        })
    }

    fn write(&self, out: &mut BytesMut) {
        out.put_u16_le(self.block_length);
        out.put_u16_le(self.template_id);
        out.put_u16_le(self.schema_id);
        out.put_u16_le(self.version);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I32(i32),
    I64(i64),
    Str(String),
}

impl Value {
    fn as_i128(&self) -> Option<i128> {
        match *self {
            Value::U8(v) => Some(v as i128),
            Value::U16(v) => Some(v as i128),
            Value::U32(v) => Some(v as i128),
            Value::U64(v) => Some(v as i128),
            Value::I8(v) => Some(v as i128),
            Value::I32(v) => Some(v as i128),
            Value::I64(v) => Some(v as i128),
            Value::Str(_) => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_i128().and_then(|v| u64::try_from(v).ok())
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_i128().and_then(|v| i64::try_from(v).ok())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

macro_rules! value_from {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::$variant(v)
            }
        })*
    };
}

value_from!(u8 => U8, u16 => U16, u32 => U32, u64 => U64, i8 => I8, i32 => I32, i64 => I64, String => Str);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unknown template id {0}")]
    UnknownTemplate(u16),
    #[error("template {template} has no field `{field}`")]
    UnknownField { template: &'static str, field: String },
    #[error("template {template} has no group `{group}`")]
    UnknownGroup { template: &'static str, group: String },
    #[error("entry {entry} is out of range for group `{group}`")]
    EntryOutOfRange { group: String, entry: usize },
    #[error("group `{group}` holds at most {max} entries")]
    GroupFull { group: String, max: usize },
    #[error("value for `{field}` does not fit {ty:?}")]
    ValueOutOfRange { field: String, ty: FieldType },
    #[error("buffer too short: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("schema id {found} does not match expected {expected}")]
    SchemaMismatch { expected: u16, found: u16 },
}

fn write_value(block: &mut [u8], field: &FieldDef, value: &Value) -> Result<(), CodecError> {
    let out_of_range = || CodecError::ValueOutOfRange { field: field.name.to_string(), ty: field.ty };
    let dst = &mut block[field.offset..field.offset + field.ty.size()];

    if let FieldType::Char(len) = field.ty {
        let text = value.as_str().ok_or_else(out_of_range)?;
        if text.len() > len || !text.is_ascii() {
            return Err(out_of_range());
        }
        dst.fill(0);
        dst[..text.len()].copy_from_slice(text.as_bytes());
        return Ok(());
    }

    let v = value.as_i128().ok_or_else(out_of_range)?;
    let (min, max) = field.ty.range().ok_or_else(out_of_range)?;
    if v < min || v > max {
        return Err(out_of_range());
    }
    match field.ty {
        FieldType::U8 => dst.copy_from_slice(&(v as u8).to_le_bytes()),
        FieldType::U16 => dst.copy_from_slice(&(v as u16).to_le_bytes()),
        FieldType::U32 => dst.copy_from_slice(&(v as u32).to_le_bytes()),
        FieldType::U64 => dst.copy_from_slice(&(v as u64).to_le_bytes()),
        FieldType::I8 => dst.copy_from_slice(&(v as i8).to_le_bytes()),
        FieldType::I32 => dst.copy_from_slice(&(v as i32).to_le_bytes()),
        FieldType::I64 => dst.copy_from_slice(&(v as i64).to_le_bytes()),
        FieldType::Char(_) => unreachable!("handled above"),
    }
    Ok(())
}

fn read_value(block: &[u8], field: &FieldDef) -> Result<Value, CodecError> {
    let end = field.offset + field.ty.size();
    if block.len() < end {
        return Err(CodecError::Truncated { needed: end, available: block.len() });
    }
    let src = &block[field.offset..end];
    let value = match field.ty {
        FieldType::U8 => Value::U8(src[0]),
        FieldType::I8 => Value::I8(src[0] as i8),
        FieldType::U16 => Value::U16(read_u16(src, 0)),
        FieldType::U32 => Value::U32(u32::from_le_bytes([src[0], src[1], src[2], src[3]])),
        FieldType::I32 => Value::I32(i32::from_le_bytes([src[0], src[1], src[2], src[3]])),
        FieldType::U64 => Value::U64(u64::from_le_bytes(eight(src))),
        FieldType::I64 => Value::I64(i64::from_le_bytes(eight(src))),
        FieldType::Char(_) => {
            let text = src.split(|b| *b == 0).next().unwrap_or_default();
            Value::Str(String::from_utf8_lossy(text).into_owned())
        }
    };
    Ok(value)
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn eight(src: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&src[..8]);
    out
}

/// Builds one message of a template by named field assignment.
#[derive(Debug, Clone)]
pub struct MessageEncoder {
    schema: &'static Schema,
    template: &'static TemplateDef,
    root: Vec<u8>,
    groups: Vec<Vec<Vec<u8>>>,
}

impl MessageEncoder {
    pub fn new(schema: &'static Schema, template_id: u16) -> Result<Self, CodecError> {
        let template = schema
            .templates
            .iter()
            .find(|t| t.id == template_id)
            .ok_or(CodecError::UnknownTemplate(template_id))?;
        Ok(MessageEncoder {
            schema,
            template,
            root: vec![0; template.block_length as usize],
            groups: vec![Vec::new(); template.groups.len()],
        })
    }

    pub fn template_id(&self) -> u16 {
        self.template.id
    }

    pub fn set_field(&mut self, field: &str, value: impl Into<Value>) -> Result<(), CodecError> {
        let def = self.template.field(field)?;
        write_value(&mut self.root, def, &value.into())
    }

    /// Appends a zeroed entry to `group` and returns its index.
    pub fn add_entry(&mut self, group: &str) -> Result<usize, CodecError> {
        let index = self.template.group_index(group)?;
        let def = &self.template.groups[index];
        let entries = &mut self.groups[index];
        let max = self.schema.group_header.max_entries();
        if entries.len() >= max {
            return Err(CodecError::GroupFull { group: group.to_string(), max });
        }
        entries.push(vec![0; def.block_length as usize]);
        Ok(entries.len() - 1)
    }

    pub fn set_entry_field(
        &mut self,
        group: &str,
        entry: usize,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<(), CodecError> {
        let index = self.template.group_index(group)?;
        let def = &self.template.groups[index];
        let field_def = find_field(def.fields, field).ok_or_else(|| CodecError::UnknownField {
            template: self.template.name,
            field: format!("{group}.{field}"),
        })?;
        let block = self.groups[index]
            .get_mut(entry)
            .ok_or_else(|| CodecError::EntryOutOfRange { group: group.to_string(), entry })?;
        write_value(block, field_def, &value.into())
    }

    pub fn entry_count(&self, group: &str) -> Result<usize, CodecError> {
        let index = self.template.group_index(group)?;
        Ok(self.groups[index].len())
    }

    pub fn encoded_length(&self) -> usize {
        let header_len = self.schema.group_header.len();
        MESSAGE_HEADER_LEN
            + self.root.len()
            + self
                .groups
                .iter()
                .zip(self.template.groups)
                .map(|(entries, def)| header_len + entries.len() * def.block_length as usize)
                .sum::<usize>()
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.encoded_length());
        MessageHeader {
            block_length: self.template.block_length,
            template_id: self.template.id,
            schema_id: self.schema.id,
            version: self.schema.version,
        }
        .write(&mut out);
        out.put_slice(&self.root);
        for (entries, def) in self.groups.iter().zip(self.template.groups) {
            out.put_u16_le(def.block_length);
            match self.schema.group_header {
                GroupHeader::Compact => out.put_u8(entries.len() as u8),
                GroupHeader::Standard => out.put_u16_le(entries.len() as u16),
            }
            for entry in entries {
                out.put_slice(entry);
            }
        }
        out.freeze()
    }
}

/// Read-only view of one encoded message.
#[derive(Debug)]
pub struct DecodedMessage<'a> {
    template: &'static TemplateDef,
    header: MessageHeader,
    root: &'a [u8],
    groups: Vec<Vec<&'a [u8]>>,
    length: usize,
}

impl<'a> DecodedMessage<'a> {
    pub fn decode(schema: &'static Schema, buf: &'a [u8]) -> Result<Self, CodecError> {
        let header = MessageHeader::read(buf)?;
        if header.schema_id != schema.id {
            return Err(CodecError::SchemaMismatch { expected: schema.id, found: header.schema_id });
        }
        let template = schema
            .templates
            .iter()
            .find(|t| t.id == header.template_id)
            .ok_or(CodecError::UnknownTemplate(header.template_id))?;

        let mut pos = MESSAGE_HEADER_LEN;
        let root = take(buf, &mut pos, header.block_length as usize)?;

        let mut groups = Vec::with_capacity(template.groups.len());
        for _ in template.groups {
            let dim = take(buf, &mut pos, schema.group_header.len())?;
            let block_length = read_u16(dim, 0) as usize;
            let count = match schema.group_header {
                GroupHeader::Compact => dim[2] as usize,
                GroupHeader::Standard => read_u16(dim, 2) as usize,
            };
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                entries.push(take(buf, &mut pos, block_length)?);
            }
            groups.push(entries);
        }

        Ok(DecodedMessage { template, header, root, groups, length: pos })
    }

    pub fn header(&self) -> MessageHeader {
        self.header
    }

    pub fn template_id(&self) -> u16 {
        self.template.id
    }

    pub fn template_name(&self) -> &'static str {
        self.template.name
    }

    /// Bytes consumed by the message, header included.
    pub fn encoded_length(&self) -> usize {
        self.length
    }

    pub fn get(&self, field: &str) -> Result<Value, CodecError> {
        read_value(self.root, self.template.field(field)?)
    }

    pub fn group_len(&self, group: &str) -> Result<usize, CodecError> {
        Ok(self.groups[self.template.group_index(group)?].len())
    }

    pub fn entry_field(&self, group: &str, entry: usize, field: &str) -> Result<Value, CodecError> {
        let index = self.template.group_index(group)?;
        let def = &self.template.groups[index];
        let field_def = find_field(def.fields, field).ok_or_else(|| CodecError::UnknownField {
            template: self.template.name,
            field: format!("{group}.{field}"),
        })?;
        let block = self.groups[index]
            .get(entry)
            .ok_or_else(|| CodecError::EntryOutOfRange { group: group.to_string(), entry })?;
        read_value(block, field_def)
    }
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], CodecError> {
    let end = *pos + len;
    if end > buf.len() {
        return Err(CodecError::Truncated { needed: end, available: buf.len() });
    }
    let slice = &buf[*pos..end];
    *pos = end;
    Ok(slice)
}

#[cfg(test)]
mod tests {
    use super::*;

    static ENTRY_FIELDS: [FieldDef; 2] = [
        FieldDef { name: "Px", offset: 0, ty: FieldType::I64 },
        FieldDef { name: "Qty", offset: 8, ty: FieldType::I32 },
    ];
    static GROUPS: [GroupDef; 1] = [GroupDef { name: "Entries", block_length: 16, fields: &ENTRY_FIELDS }];
    static ROOT_FIELDS: [FieldDef; 2] = [
        FieldDef { name: "Time", offset: 0, ty: FieldType::U64 },
        FieldDef { name: "Tag", offset: 8, ty: FieldType::Char(4) },
    ];
    static TEMPLATES: [TemplateDef; 1] = [TemplateDef {
        id: 7,
        name: "Sample",
        block_length: 12,
        fields: &ROOT_FIELDS,
        groups: &GROUPS,
    }];
    static SCHEMA: Schema = Schema { id: 3, version: 1, group_header: GroupHeader::Compact, templates: &TEMPLATES };

    #[test]
    fn test_encode_layout_and_length() {
        let mut enc = MessageEncoder::new(&SCHEMA, 7).unwrap();
        enc.set_field("Time", 42u64).unwrap();
        enc.set_field("Tag", "AB").unwrap();
        let e = enc.add_entry("Entries").unwrap();
        enc.set_entry_field("Entries", e, "Px", 1_000i64).unwrap();
        enc.set_entry_field("Entries", e, "Qty", 5i32).unwrap();

        assert_eq!(enc.encoded_length(), 8 + 12 + 3 + 16);
        let bytes = enc.encode();
        assert_eq!(bytes.len(), enc.encoded_length());
        // header: blockLength 12, template 7, schema 3, version 1
        assert_eq!(&bytes[..8], &[12, 0, 7, 0, 3, 0, 1, 0]);
        assert_eq!(&bytes[16..20], b"AB\0\0");
        // group dimension: blockLength 16, one entry
        assert_eq!(&bytes[20..23], &[16, 0, 1]);
    }

    #[test]
    fn test_decode_reads_back_fields() {
        let mut enc = MessageEncoder::new(&SCHEMA, 7).unwrap();
        enc.set_field("Time", 9u64).unwrap();
        for qty in [1i32, 2, 3] {
            let e = enc.add_entry("Entries").unwrap();
            enc.set_entry_field("Entries", e, "Qty", qty).unwrap();
        }
        let bytes = enc.encode();
        let msg = DecodedMessage::decode(&SCHEMA, &bytes).unwrap();
        assert_eq!(msg.template_name(), "Sample");
        assert_eq!(msg.get("Time").unwrap().as_u64(), Some(9));
        assert_eq!(msg.group_len("Entries").unwrap(), 3);
        assert_eq!(msg.entry_field("Entries", 2, "Qty").unwrap(), Value::I32(3));
        assert_eq!(msg.encoded_length(), bytes.len());
    }

    #[test]
    fn test_rejects_bad_values_and_names() {
        let mut enc = MessageEncoder::new(&SCHEMA, 7).unwrap();
        assert!(matches!(enc.set_field("Nope", 1u8), Err(CodecError::UnknownField { .. })));
        assert!(matches!(enc.set_field("Tag", "TOOLONG"), Err(CodecError::ValueOutOfRange { .. })));
        assert!(matches!(enc.set_field("Time", -1i64), Err(CodecError::ValueOutOfRange { .. })));
        assert!(matches!(
            enc.set_entry_field("Entries", 0, "Qty", 1i32),
            Err(CodecError::EntryOutOfRange { .. })
        ));
        assert_eq!(MessageEncoder::new(&SCHEMA, 99).unwrap_err(), CodecError::UnknownTemplate(99));
    }

    #[test]
    fn test_decode_truncated() {
        let mut enc = MessageEncoder::new(&SCHEMA, 7).unwrap();
        enc.add_entry("Entries").unwrap();
        let bytes = enc.encode();
        let err = DecodedMessage::decode(&SCHEMA, &bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }
}
