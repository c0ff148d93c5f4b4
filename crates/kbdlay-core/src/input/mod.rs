// Kbdlay Input Layer
// Scan-code event model shared by the engine and the chain adapter

mod event;

pub use event::{
    is_shift_make_code, synthetic_shift, KeyFlags, ScanEvent, MAKE_ALT, MAKE_CTRL, MAKE_LSHIFT,
    MAKE_LWIN, MAKE_RSHIFT, MAKE_RWIN, MAX_INDEXABLE_CODE,
};
