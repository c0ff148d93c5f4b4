// Kbdlay Rule Blob
// Validation and construction of rule tables from the packed binary format
//
// Layout (little-endian, packed):
//   Header  { version:u32, entry_count:u32, total_size_bytes:u32, reserved:u32 }
//   Entry[] { in_make_code:u8, in_flags:u8, out_make_code:u8, out_flags:u8 }

use crate::error::{KbdLayError, KbdLayResult};
use crate::rules::table::{RuleCell, RuleKey, RuleTable, RULE_FLAG_E0, RULE_FLAG_SHIFT};

/// The only blob version accepted
pub const RULE_BLOB_VERSION: u32 = 0x0001_0000;
/// Size of the packed header
pub const RULE_BLOB_HEADER_SIZE: usize = 16;
/// Size of one packed entry
pub const RULE_ENTRY_SIZE: usize = 4;
/// Maximum number of entries in a blob
pub const MAX_RULE_ENTRIES: u32 = 1024;
/// Maximum blob size in bytes
pub const MAX_RULE_BLOB_BYTES: usize = 64 * 1024;

/// Decoded blob header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleBlobHeader {
    pub version: u32,
    pub entry_count: u32,
    pub total_size_bytes: u32,
    pub reserved: u32,
}

impl RuleBlobHeader {
    /// Header for a well-formed blob carrying `entry_count` entries
    pub fn for_entries(entry_count: u32) -> Self {
        Self {
            version: RULE_BLOB_VERSION,
            entry_count,
            total_size_bytes: (RULE_BLOB_HEADER_SIZE + entry_count as usize * RULE_ENTRY_SIZE)
                as u32,
            reserved: 0,
        }
    }

    /// Decode the header from the start of `bytes`
    pub fn read(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < RULE_BLOB_HEADER_SIZE {
            return None;
        }
        Some(Self {
            version: read_u32_le(bytes, 0),
            entry_count: read_u32_le(bytes, 4),
            total_size_bytes: read_u32_le(bytes, 8),
            reserved: read_u32_le(bytes, 12),
        })
    }

    /// Append the packed header to `out`
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.entry_count.to_le_bytes());
        out.extend_from_slice(&self.total_size_bytes.to_le_bytes());
        out.extend_from_slice(&self.reserved.to_le_bytes());
    }
}

/// One packed rule entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleEntry {
    pub in_make_code: u8,
    pub in_flags: u8,
    pub out_make_code: u8,
    pub out_flags: u8,
}

impl RuleEntry {
    pub fn new(in_make_code: u8, in_flags: u8, out_make_code: u8, out_flags: u8) -> Self {
        Self {
            in_make_code,
            in_flags,
            out_make_code,
            out_flags,
        }
    }

    fn read(bytes: &[u8]) -> Self {
        Self::new(bytes[0], bytes[1], bytes[2], bytes[3])
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[
            self.in_make_code,
            self.in_flags,
            self.out_make_code,
            self.out_flags,
        ]);
    }
}

fn read_u32_le(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Validate a blob and return its header.
///
/// Checks run in a fixed order and the first failure wins:
/// 1. length within `[header size, 64 KiB]`
/// 2. supported version and zero reserved field
/// 3. declared total size equals the actual length
/// 4. entry count within limit and exactly filling the blob
pub fn validate_rule_blob(blob: &[u8]) -> KbdLayResult<RuleBlobHeader> {
    if blob.len() < RULE_BLOB_HEADER_SIZE || blob.len() > MAX_RULE_BLOB_BYTES {
        return Err(KbdLayError::InvalidParameter);
    }
    let header = RuleBlobHeader::read(blob).ok_or(KbdLayError::InvalidParameter)?;

    if header.version != RULE_BLOB_VERSION || header.reserved != 0 {
        return Err(KbdLayError::InvalidParameter);
    }
    if header.total_size_bytes as usize != blob.len() {
        return Err(KbdLayError::InvalidParameter);
    }
    if header.entry_count > MAX_RULE_ENTRIES {
        return Err(KbdLayError::InvalidParameter);
    }
    let expected = RULE_BLOB_HEADER_SIZE + header.entry_count as usize * RULE_ENTRY_SIZE;
    if expected != header.total_size_bytes as usize {
        return Err(KbdLayError::InvalidParameter);
    }
    Ok(header)
}

/// Validate a blob and build a fresh rule table from it.
///
/// Nothing outside the returned table is touched, so a rejected blob can
/// never disturb a live table. Later entries for the same key overwrite
/// earlier ones.
pub fn parse_rule_blob(blob: &[u8]) -> KbdLayResult<RuleTable> {
    let header = validate_rule_blob(blob)?;
    let mut table = RuleTable::try_empty()?;

    let entries = &blob[RULE_BLOB_HEADER_SIZE..];
    for chunk in entries
        .chunks_exact(RULE_ENTRY_SIZE)
        .take(header.entry_count as usize)
    {
        let entry = RuleEntry::read(chunk);
        table.insert(
            RuleKey::from_flags(entry.in_make_code, entry.in_flags),
            RuleCell::new(entry.out_make_code, entry.out_flags),
        );
    }
    Ok(table)
}

/// Builder for well-formed rule blobs
#[derive(Debug, Clone, Default)]
pub struct RuleBlobBuilder {
    entries: Vec<RuleEntry>,
}

impl RuleBlobBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a raw entry
    pub fn entry(mut self, entry: RuleEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Add a rule from a table key to an output cell
    pub fn rule(self, key: RuleKey, cell: RuleCell) -> Self {
        let mut in_flags = 0;
        if key.e0 {
            in_flags |= RULE_FLAG_E0;
        }
        if key.shift {
            in_flags |= RULE_FLAG_SHIFT;
        }
        self.entry(RuleEntry::new(
            key.make_code,
            in_flags,
            cell.out_make_code,
            cell.out_flags,
        ))
    }

    /// Number of entries added so far
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize header and entries
    pub fn build(&self) -> Vec<u8> {
        let header = RuleBlobHeader::for_entries(self.entries.len() as u32);
        let mut out = Vec::with_capacity(header.total_size_bytes as usize);
        header.write(&mut out);
        for entry in &self.entries {
            entry.write(&mut out);
        }
        out
    }
}

/// Serialize a table back into blob form, one entry per valid cell
pub fn encode_rule_table(table: &RuleTable) -> Vec<u8> {
    table
        .iter()
        .fold(RuleBlobBuilder::new(), |builder, (key, cell)| builder.rule(key, cell))
        .build()
}
