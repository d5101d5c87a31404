//! Memory tiers for a SmartGraph session.
//!
//! Short-term memory is volatile and reset per session. Long-term memory
//! survives sessions: it is loaded once at startup, stamped on every
//! mutation, persisted to a JSON file, and evicted by TTL on request.

pub mod manager;
pub mod persist;
pub mod relevance;

pub use manager::{
    keys, LongTermMemory, MemoryManager, MemorySettings, MemoryState, ShortTermMemory,
};
pub use relevance::{relevant_facts, trim_to_words, word_count};
