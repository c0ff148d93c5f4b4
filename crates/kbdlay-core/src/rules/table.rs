// Kbdlay Rule Table
// Fixed 2x2x256 lookup of (E0, shift, make code) -> output cell

use std::fmt;

use crate::error::{KbdLayError, KbdLayResult};

/// Rule flag: E0 prefix (input: present on the key; output: emit with E0)
pub const RULE_FLAG_E0: u8 = 0x01;
/// Rule flag: shift (input: shift physically held; output: shift desired)
pub const RULE_FLAG_SHIFT: u8 = 0x02;
/// Bits of a rule flag byte that carry meaning
pub const RULE_FLAG_MASK: u8 = RULE_FLAG_E0 | RULE_FLAG_SHIFT;

const CODES_PER_PLANE: usize = 256;
const PLANES: usize = 4;
/// Number of addressable cells in a table
pub const RULE_TABLE_CELLS: usize = PLANES * CODES_PER_PLANE;

/// Output half of a rule: the code and prefix/shift intent to emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RuleCell {
    pub out_make_code: u8,
    pub out_flags: u8,
}

impl RuleCell {
    /// Create a cell; undefined flag bits are dropped
    pub fn new(out_make_code: u8, out_flags: u8) -> Self {
        Self {
            out_make_code,
            out_flags: out_flags & RULE_FLAG_MASK,
        }
    }

    /// A zero output code means "no mapping" even when the cell is valid
    pub fn is_mapped(&self) -> bool {
        self.out_make_code != 0
    }

    pub fn wants_e0(&self) -> bool {
        self.out_flags & RULE_FLAG_E0 != 0
    }

    pub fn wants_shift(&self) -> bool {
        self.out_flags & RULE_FLAG_SHIFT != 0
    }
}

/// Input half of a rule: which table cell an event addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleKey {
    pub e0: bool,
    pub shift: bool,
    pub make_code: u8,
}

impl RuleKey {
    pub fn new(e0: bool, shift: bool, make_code: u8) -> Self {
        Self {
            e0,
            shift,
            make_code,
        }
    }

    /// Build a key from a blob entry's input flag byte
    pub fn from_flags(make_code: u8, in_flags: u8) -> Self {
        let in_flags = in_flags & RULE_FLAG_MASK;
        Self::new(
            in_flags & RULE_FLAG_E0 != 0,
            in_flags & RULE_FLAG_SHIFT != 0,
            make_code,
        )
    }

    #[inline]
    fn index(self) -> usize {
        let plane = (self.e0 as usize) * 2 + self.shift as usize;
        plane * CODES_PER_PLANE + self.make_code as usize
    }

    fn from_index(index: usize) -> Self {
        let plane = index / CODES_PER_PLANE;
        Self::new(plane & 2 != 0, plane & 1 != 0, (index % CODES_PER_PLANE) as u8)
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:02x}{}",
            if self.e0 { "e0 " } else { "" },
            self.make_code,
            if self.shift { "+shift" } else { "" }
        )
    }
}

/// Rule lookup table.
///
/// Cells are stored flat in (E0, shift, code) order with a parallel validity
/// bitmap. Only cells written by the blob that built the table are valid.
/// A table is never edited after construction; devices swap whole tables.
#[derive(Clone, PartialEq, Eq)]
pub struct RuleTable {
    cells: Box<[RuleCell]>,
    valid: [u64; RULE_TABLE_CELLS / 64],
}

impl RuleTable {
    /// Empty table: every lookup misses
    pub fn empty() -> Self {
        Self {
            cells: vec![RuleCell::default(); RULE_TABLE_CELLS].into_boxed_slice(),
            valid: [0; RULE_TABLE_CELLS / 64],
        }
    }

    /// Empty table whose storage allocation may fail gracefully
    pub(crate) fn try_empty() -> KbdLayResult<Self> {
        let mut cells = Vec::new();
        cells
            .try_reserve_exact(RULE_TABLE_CELLS)
            .map_err(|_| KbdLayError::InsufficientResources)?;
        cells.resize(RULE_TABLE_CELLS, RuleCell::default());
        Ok(Self {
            cells: cells.into_boxed_slice(),
            valid: [0; RULE_TABLE_CELLS / 64],
        })
    }

    /// Store a cell, overwriting any earlier rule for the same key
    pub(crate) fn insert(&mut self, key: RuleKey, cell: RuleCell) {
        let index = key.index();
        self.cells[index] = cell;
        self.valid[index / 64] |= 1u64 << (index % 64);
    }

    /// Check if a key was set by the building blob
    #[inline]
    pub fn is_valid(&self, key: RuleKey) -> bool {
        let index = key.index();
        self.valid[index / 64] & (1u64 << (index % 64)) != 0
    }

    /// Get the cell for a key if it is valid
    #[inline]
    pub fn lookup(&self, key: RuleKey) -> Option<RuleCell> {
        if self.is_valid(key) {
            Some(self.cells[key.index()])
        } else {
            None
        }
    }

    /// Number of valid cells
    pub fn len(&self) -> usize {
        self.valid.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.valid.iter().all(|w| *w == 0)
    }

    /// Iterate valid cells in index order
    pub fn iter(&self) -> impl Iterator<Item = (RuleKey, RuleCell)> + '_ {
        (0..RULE_TABLE_CELLS).filter_map(move |index| {
            if self.valid[index / 64] & (1u64 << (index % 64)) != 0 {
                Some((RuleKey::from_index(index), self.cells[index]))
            } else {
                None
            }
        })
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for RuleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleTable")
            .field("valid_cells", &self.len())
            .finish()
    }
}
