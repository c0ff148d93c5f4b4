// Kbdlay Transform Module
// Scan-code remapping applied on the event path

pub mod engine;

pub use engine::{
    apply_cell, EngineConfig, ModifierPolicy, Outcome, RemapEngine, Transformed,
    DEFAULT_RELAY_CAPACITY, MAX_OUTPUT_EVENTS, MIN_RELAY_CAPACITY,
};
