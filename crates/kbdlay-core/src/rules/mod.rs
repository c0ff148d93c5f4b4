// Kbdlay Rules
// Rule blob format and the lookup table built from it

pub mod blob;
pub mod table;

pub use blob::{
    encode_rule_table, parse_rule_blob, validate_rule_blob, RuleBlobBuilder, RuleBlobHeader,
    RuleEntry, MAX_RULE_BLOB_BYTES, MAX_RULE_ENTRIES, RULE_BLOB_HEADER_SIZE, RULE_BLOB_VERSION,
    RULE_ENTRY_SIZE,
};
pub use table::{
    RuleCell, RuleKey, RuleTable, RULE_FLAG_E0, RULE_FLAG_MASK, RULE_FLAG_SHIFT, RULE_TABLE_CELLS,
};
