//! The dataset and its tree of typed records (datums).

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use super::guid::Guid;

#[derive(Debug)]
pub enum RecordError {
    ShortRead,
    TruncatedRecord { offset: usize, declared_size: u16 },
    HeaderTooSmall { value_type: u16, declared_size: u16 },
    DatasetInvalid(&'static str),
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordError::ShortRead => write!(f, "buffer too short to contain a record header"),
            RecordError::TruncatedRecord { offset, declared_size } => write!(
                f,
                "record at offset {} declares size {} beyond buffer bounds",
                offset, declared_size
            ),
            RecordError::HeaderTooSmall { value_type, declared_size } => write!(
                f,
                "record of value_type {} declares size {} smaller than its fixed header",
                value_type, declared_size
            ),
            RecordError::DatasetInvalid(why) => write!(f, "dataset invalid: {}", why),
        }
    }
}

impl std::error::Error for RecordError {}

/// Known record value types. Only the variants the core engine reads are
/// decoded structurally; everything else is kept as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Key {
        algorithm: u16,
        payload: Vec<u8>,
    },
    StretchKey {
        salt: [u8; 16],
        nested: Vec<TaggedRecord>,
    },
    UseKey {
        nested: Vec<TaggedRecord>,
    },
    AesCcm {
        nonce: [u8; 12],
        tag: [u8; 16],
        ciphertext: Vec<u8>,
    },
    Vmk {
        guid: Guid,
        nonce: [u8; 12],
        nested: Vec<TaggedRecord>,
    },
    ExternalKey {
        guid: Guid,
        nested: Vec<TaggedRecord>,
    },
    VirtualizationInfo {
        backup_address: u64,
        virtualized_size: u64,
    },
    /// Any record whose value_type the core does not need to inspect
    /// structurally (UNICODE, VALIDATION, UPDATE, TPM-bound records, ...).
    Unknown {
        value_type: u16,
        raw: Vec<u8>,
    },
}

/// A record together with the 8-byte safe header fields callers search on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedRecord {
    pub entry_type: u16,
    pub value_type: u16,
    pub error_status: u16,
    pub record: Record,
}

const SAFE_HEADER_SIZE: usize = 8;

pub const VALUE_KEY: u16 = 1;
pub const VALUE_STRETCH_KEY: u16 = 3;
pub const VALUE_USE_KEY: u16 = 4;
pub const VALUE_AES_CCM: u16 = 5;
pub const VALUE_VMK: u16 = 8;
pub const VALUE_EXTERNAL_KEY: u16 = 9;
pub const VALUE_VIRTUALIZATION_INFO: u16 = 15;

fn fixed_header_size(value_type: u16) -> usize {
    match value_type {
        0 => 8,                       // ERASED
        VALUE_KEY => 0xc,
        2 => 8,                       // UNICODE
        VALUE_STRETCH_KEY => 0x1c,
        VALUE_USE_KEY => 0xc,
        VALUE_AES_CCM => 0x24,
        6 => 0xc,                     // TPM_ENCODED
        7 => 8,                       // VALIDATION
        VALUE_VMK => 0x24,
        VALUE_EXTERNAL_KEY => 0x20,
        10 => 0x2c,                   // UPDATE
        11 => 0x34,                   // ERROR
        VALUE_VIRTUALIZATION_INFO => 0x18,
        _ => 8,
    }
}

fn parse_nested(buf: &[u8]) -> Result<Vec<TaggedRecord>, RecordError> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset + SAFE_HEADER_SIZE <= buf.len() {
        let (tagged, consumed) = parse_one(&buf[offset..], offset)?;
        out.push(tagged);
        offset += consumed;
    }
    Ok(out)
}

fn parse_one(buf: &[u8], absolute_offset: usize) -> Result<(TaggedRecord, usize), RecordError> {
    if buf.len() < SAFE_HEADER_SIZE {
        return Err(RecordError::ShortRead);
    }
    let size = LittleEndian::read_u16(&buf[0..2]);
    let entry_type = LittleEndian::read_u16(&buf[2..4]);
    let value_type = LittleEndian::read_u16(&buf[4..6]);
    let error_status = LittleEndian::read_u16(&buf[6..8]);

    if (size as usize) < fixed_header_size(value_type) {
        return Err(RecordError::HeaderTooSmall { value_type, declared_size: size });
    }
    if (size as usize) > buf.len() {
        return Err(RecordError::TruncatedRecord { offset: absolute_offset, declared_size: size });
    }
    let body = &buf[SAFE_HEADER_SIZE..size as usize];

    let record = match value_type {
        VALUE_KEY => {
            let algorithm = LittleEndian::read_u16(&body[0..2]);
            let payload = body[4..].to_vec();
            Record::Key { algorithm, payload }
        }
        VALUE_STRETCH_KEY => {
            let mut salt = [0u8; 16];
            salt.copy_from_slice(&body[4..20]);
            let nested = parse_nested(&body[20..])?;
            Record::StretchKey { salt, nested }
        }
        VALUE_USE_KEY => {
            let nested = parse_nested(&body[4..])?;
            Record::UseKey { nested }
        }
        VALUE_AES_CCM => {
            let mut nonce = [0u8; 12];
            nonce.copy_from_slice(&body[0..12]);
            let mut tag = [0u8; 16];
            tag.copy_from_slice(&body[12..28]);
            let ciphertext = body[28..].to_vec();
            Record::AesCcm { nonce, tag, ciphertext }
        }
        VALUE_VMK => {
            let guid = Guid::from_bytes(&body[0..16]).ok_or(RecordError::ShortRead)?;
            let mut nonce = [0u8; 12];
            nonce.copy_from_slice(&body[16..28]);
            let nested = parse_nested(&body[28..])?;
            Record::Vmk { guid, nonce, nested }
        }
        VALUE_EXTERNAL_KEY => {
            let guid = Guid::from_bytes(&body[0..16]).ok_or(RecordError::ShortRead)?;
            let nested = parse_nested(&body[24..])?;
            Record::ExternalKey { guid, nested }
        }
        VALUE_VIRTUALIZATION_INFO => {
            let backup_address = LittleEndian::read_u64(&body[0..8]);
            let virtualized_size = LittleEndian::read_u64(&body[8..16]);
            Record::VirtualizationInfo { backup_address, virtualized_size }
        }
        other => Record::Unknown { value_type: other, raw: body.to_vec() },
    };

    Ok((TaggedRecord { entry_type, value_type, error_status, record }, size as usize))
}

/// The dataset header plus its top-level records.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub size: u32,
    pub header_size: u32,
    pub copy_size: u32,
    pub guid: Guid,
    pub algorithm: u16,
    pub timestamp: u64,
    pub records: Vec<TaggedRecord>,
}

impl Dataset {
    pub const HEADER_SIZE: usize = 0x30;

    pub fn parse(buf: &[u8]) -> Result<Dataset, RecordError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(RecordError::ShortRead);
        }
        let size = LittleEndian::read_u32(&buf[0x00..0x04]);
        let header_size = LittleEndian::read_u32(&buf[0x04..0x08]);
        let copy_size = LittleEndian::read_u32(&buf[0x08..0x0c]);
        let guid = Guid::from_bytes(&buf[0x0c..0x1c]).ok_or(RecordError::ShortRead)?;
        let algorithm = LittleEndian::read_u16(&buf[0x20..0x22]);
        let timestamp = LittleEndian::read_u64(&buf[0x24..0x2c]);

        if header_size as usize > size as usize || size > copy_size {
            return Err(RecordError::DatasetInvalid("header_size <= size <= copy_size violated"));
        }
        if copy_size < header_size + 8 {
            return Err(RecordError::DatasetInvalid("copy_size too small to hold any record"));
        }
        if buf.len() < size as usize {
            return Err(RecordError::ShortRead);
        }

        let records = parse_nested(&buf[header_size as usize..size as usize])?;

        Ok(Dataset { size, header_size, copy_size, guid, algorithm, timestamp, records })
    }

    /// First top-level record matching `value_type`, optionally also
    /// matching `entry_type` when `Some`.
    pub fn find(&self, entry_type: Option<u16>, value_type: u16) -> Option<&TaggedRecord> {
        self.records.iter().find(|r| {
            r.value_type == value_type && entry_type.map_or(true, |e| e == r.entry_type)
        })
    }

    /// VMK record whose GUID matches exactly.
    pub fn find_vmk_by_guid(&self, target: &Guid) -> Option<&TaggedRecord> {
        self.records.iter().find(|r| matches!(&r.record, Record::Vmk { guid, .. } if guid == target))
    }

    /// VMK record whose nonce, interpreted as little-endian priority in its
    /// last two bytes, falls within `range`.
    pub fn find_vmk_by_priority(&self, range: std::ops::RangeInclusive<u16>) -> Option<&TaggedRecord> {
        self.records.iter().find(|r| match &r.record {
            Record::Vmk { nonce, .. } => {
                let priority = LittleEndian::read_u16(&nonce[10..12]);
                range.contains(&priority)
            }
            _ => false,
        })
    }
}

/// Find the first nested record of `value_type` within a slice of children.
pub fn find_nested(nested: &[TaggedRecord], value_type: u16) -> Option<&TaggedRecord> {
    nested.iter().find(|r| r.value_type == value_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_record(payload: &[u8]) -> Vec<u8> {
        let size = SAFE_HEADER_SIZE + 4 + payload.len();
        let mut buf = vec![0u8; size];
        LittleEndian::write_u16(&mut buf[0..2], size as u16);
        LittleEndian::write_u16(&mut buf[4..6], VALUE_KEY);
        LittleEndian::write_u16(&mut buf[8..10], 0x8000);
        buf[12..].copy_from_slice(payload);
        buf
    }

    #[test]
    fn parses_key_record() {
        let raw = key_record(&[1, 2, 3, 4]);
        let (tagged, consumed) = parse_one(&raw, 0).unwrap();
        assert_eq!(consumed, raw.len());
        match tagged.record {
            Record::Key { algorithm, payload } => {
                assert_eq!(algorithm, 0x8000);
                assert_eq!(payload, vec![1, 2, 3, 4]);
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn rejects_truncated_record() {
        let mut raw = key_record(&[1, 2, 3, 4]);
        LittleEndian::write_u16(&mut raw[0..2], 9000);
        assert!(matches!(parse_one(&raw, 0), Err(RecordError::TruncatedRecord { .. })));
    }

    fn dataset_with(records: &[u8]) -> Vec<u8> {
        let total = Dataset::HEADER_SIZE + records.len();
        let mut buf = vec![0u8; total];
        LittleEndian::write_u32(&mut buf[0..4], total as u32);
        LittleEndian::write_u32(&mut buf[4..8], Dataset::HEADER_SIZE as u32);
        LittleEndian::write_u32(&mut buf[8..12], total as u32);
        buf[0x30..].copy_from_slice(records);
        buf
    }

    #[test]
    fn parses_dataset_with_one_record() {
        let key = key_record(&[0xaa; 8]);
        let buf = dataset_with(&key);
        let dataset = Dataset::parse(&buf).unwrap();
        assert_eq!(dataset.records.len(), 1);
        assert!(dataset.find(None, VALUE_KEY).is_some());
    }

    #[test]
    fn rejects_dataset_with_bad_size_ordering() {
        let mut buf = dataset_with(&key_record(&[0; 4]));
        LittleEndian::write_u32(&mut buf[8..12], 4); // copy_size < size
        assert!(matches!(Dataset::parse(&buf), Err(RecordError::DatasetInvalid(_))));
    }

    #[test]
    fn finds_vmk_by_priority_range() {
        let mut buf = vec![0u8; SAFE_HEADER_SIZE + 16 + 12];
        let buf_len = buf.len() as u16;
        LittleEndian::write_u16(&mut buf[0..2], buf_len);
        LittleEndian::write_u16(&mut buf[4..6], VALUE_VMK);
        LittleEndian::write_u16(&mut buf[8 + 16 + 10..8 + 16 + 12], 0x0002);
        let (tagged, _) = parse_one(&buf, 0).unwrap();
        let dataset = Dataset {
            size: 0,
            header_size: 0,
            copy_size: 0,
            guid: Guid([0; 16]),
            algorithm: 0,
            timestamp: 0,
            records: vec![tagged],
        };
        assert!(dataset.find_vmk_by_priority(0x0000..=0x00ff).is_some());
        assert!(dataset.find_vmk_by_priority(0x2000..=0x2000).is_none());
    }
}
