pub mod duckduckgo;
pub mod memory_recall;
pub mod web_search;
