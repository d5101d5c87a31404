use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use smartgraph_core::config::MemoryConfig;
use smartgraph_core::error::Result;
use smartgraph_core::state::reducers;
use smartgraph_core::StateManager;

use crate::persist::{self, LongTermFile};
use crate::relevance::{relevant_facts, trim_to_words};

/// Well-known memory keys.
pub mod keys {
    pub const LAST_INPUT: &str = "last_input";
    pub const LAST_RESPONSE: &str = "last_response";
    pub const CONTEXT: &str = "context";
    pub const CONVERSATION_HISTORY: &str = "conversation_history";
    pub const FACTS: &str = "facts";
    pub const USER_PREFERENCES: &str = "user_preferences";
    pub const MAX_RESPONSE_LENGTH: &str = "max_response_length";
}

/// Tunables for a `MemoryManager`.
#[derive(Debug, Clone)]
pub struct MemorySettings {
    pub history_cap: usize,
    pub context_turns: usize,
    pub long_term_path: Option<PathBuf>,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            history_cap: 50,
            context_turns: 5,
            long_term_path: None,
        }
    }
}

impl From<&MemoryConfig> for MemorySettings {
    fn from(config: &MemoryConfig) -> Self {
        Self {
            history_cap: config.history_cap,
            context_turns: config.context_turns,
            long_term_path: config.long_term_path.as_ref().map(PathBuf::from),
        }
    }
}

/// Volatile per-session memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShortTermMemory {
    pub entries: BTreeMap<String, Value>,
}

/// Cross-session memory plus per-key access stamps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LongTermMemory {
    pub entries: BTreeMap<String, Value>,
    pub last_accessed: BTreeMap<String, DateTime<Utc>>,
}

/// Full memory snapshot carried by checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryState {
    pub short_term: ShortTermMemory,
    pub long_term: LongTermMemory,
}

/// Owns the short-term and long-term stores of one session.
///
/// The two tiers are separate `StateManager`s, so a long-term write never
/// blocks a short-term read. Long-term mutations stamp `last_accessed` and
/// mark the tier dirty; `flush` persists it.
pub struct MemoryManager {
    short_term: StateManager,
    long_term: StateManager,
    last_accessed: StateManager<DateTime<Utc>>,
    settings: MemorySettings,
    dirty: AtomicBool,
}

impl MemoryManager {
    pub fn new(settings: MemorySettings) -> Self {
        let short_term =
            StateManager::new().with_reducer(keys::CONTEXT, reducers::merge_object());
        let long_term = StateManager::new()
            .with_reducer(
                keys::CONVERSATION_HISTORY,
                reducers::append_capped(settings.history_cap),
            )
            .with_reducer(keys::USER_PREFERENCES, reducers::merge_object())
            .with_reducer(keys::MAX_RESPONSE_LENGTH, reducers::max_number());

        let manager = Self {
            short_term,
            long_term,
            last_accessed: StateManager::new(),
            settings,
            dirty: AtomicBool::new(false),
        };
        manager.reset_short_term();
        manager
    }

    pub fn shared(settings: MemorySettings) -> Arc<Self> {
        Arc::new(Self::new(settings))
    }

    pub fn settings(&self) -> &MemorySettings {
        &self.settings
    }

    // ── Short-term ──────────────────────────────────────────────

    pub fn update_short_term(&self, key: impl Into<String>, value: Value) {
        self.short_term.update(key, value);
    }

    pub fn get_short_term(&self, key: &str) -> Option<Value> {
        self.short_term.get(key)
    }

    /// Reset short-term memory to its session-start shape.
    pub fn reset_short_term(&self) {
        self.short_term.restore([
            (keys::LAST_INPUT.to_string(), json!("")),
            (keys::LAST_RESPONSE.to_string(), json!("")),
            (keys::CONTEXT.to_string(), json!({})),
        ]);
    }

    // ── Long-term ───────────────────────────────────────────────

    /// Write a long-term entry. `conversation_history` appends (capped);
    /// every other key goes through its reducer or overwrites.
    pub fn update_long_term(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.write_long_term(&key, |long_term| long_term.update(key.clone(), value));
    }

    pub fn get_long_term(&self, key: &str) -> Option<Value> {
        self.long_term.get(key)
    }

    /// Remove a long-term entry.
    pub fn delete_long_term(&self, key: &str) -> Option<Value> {
        let mut removed = None;
        self.last_accessed.delete_if(key, |_| {
            removed = self.long_term.delete(key);
            true
        });
        let removed = removed.or_else(|| self.long_term.delete(key));
        if removed.is_some() {
            self.mark_dirty();
        }
        removed
    }

    pub fn long_term_keys(&self) -> Vec<String> {
        self.long_term.keys()
    }

    pub fn last_accessed(&self, key: &str) -> Option<DateTime<Utc>> {
        self.last_accessed.get(key)
    }

    /// Append a fact unless an identical one is already stored.
    /// Returns whether it was added.
    pub fn add_fact(&self, fact: impl Into<String>) -> bool {
        let fact = fact.into();
        let mut added = false;
        self.write_long_term(keys::FACTS, |long_term| {
            long_term.update_with(keys::FACTS, |old| {
                let mut facts = match old {
                    Some(Value::Array(items)) => items.clone(),
                    _ => Vec::new(),
                };
                if !facts.iter().any(|f| f.as_str() == Some(fact.as_str())) {
                    facts.push(Value::String(fact.clone()));
                    added = true;
                }
                Value::Array(facts)
            });
        });
        added
    }

    pub fn facts(&self) -> Vec<String> {
        string_list(self.long_term.get(keys::FACTS))
    }

    pub fn set_preference(&self, key: impl Into<String>, value: Value) {
        let mut update = serde_json::Map::new();
        update.insert(key.into(), value);
        self.update_long_term(keys::USER_PREFERENCES, Value::Object(update));
    }

    pub fn preferences(&self) -> serde_json::Map<String, Value> {
        match self.long_term.get(keys::USER_PREFERENCES) {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }

    /// Append `role: text` to the conversation history.
    pub fn record_turn(&self, role: &str, text: &str) {
        self.update_long_term(keys::CONVERSATION_HISTORY, json!(format!("{}: {}", role, text)));
    }

    pub fn conversation_history(&self) -> Vec<String> {
        string_list(self.long_term.get(keys::CONVERSATION_HISTORY))
    }

    /// The newest `k` turns, oldest first.
    pub fn recent_turns(&self, k: usize) -> Vec<String> {
        let history = self.conversation_history();
        let skip = history.len().saturating_sub(k);
        history.into_iter().skip(skip).collect()
    }

    // ── Context ─────────────────────────────────────────────────

    /// Assemble model context for `current_query` within `max_tokens` words.
    ///
    /// Sections, in order: recent turns, facts relevant to the query, user
    /// preferences. Empty sections are left out; an empty memory yields "".
    pub fn build_context(&self, current_query: &str, max_tokens: usize) -> String {
        let mut sections = Vec::new();

        let turns = self.recent_turns(self.settings.context_turns);
        if !turns.is_empty() {
            sections.push(format!("Conversation:\n{}", turns.join("\n")));
        }

        let facts = self.facts();
        let relevant = relevant_facts(&facts, current_query);
        if !relevant.is_empty() {
            let lines: Vec<String> = relevant.iter().map(|f| format!("- {}", f)).collect();
            sections.push(format!("Relevant facts:\n{}", lines.join("\n")));
        }

        let prefs = self.preferences();
        if !prefs.is_empty() {
            let lines: Vec<String> = prefs
                .iter()
                .map(|(k, v)| match v {
                    Value::String(s) => format!("{}: {}", k, s),
                    other => format!("{}: {}", k, other),
                })
                .collect();
            sections.push(format!("User preferences:\n{}", lines.join("\n")));
        }

        trim_to_words(&sections.join("\n\n"), max_tokens)
    }

    // ── Expiry ──────────────────────────────────────────────────

    /// Evict long-term keys idle for longer than `ttl`. Returns removed keys.
    pub fn cleanup_long_term_memory(&self, ttl: Duration) -> Vec<String> {
        let Some(cutoff) = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        else {
            return Vec::new();
        };

        let candidates: Vec<String> = self
            .last_accessed
            .snapshot()
            .into_iter()
            .filter(|(_, at)| *at < cutoff)
            .map(|(key, _)| key)
            .collect();

        // The recheck and the eviction run under the `last_accessed` lock,
        // so a key written after the snapshot keeps its fresh stamp.
        let mut stale = Vec::with_capacity(candidates.len());
        for key in candidates {
            let evicted = self.last_accessed.delete_if(&key, |at| {
                let expired = *at < cutoff;
                if expired {
                    self.long_term.delete(&key);
                }
                expired
            });
            if evicted.is_some() {
                stale.push(key);
            }
        }

        if !stale.is_empty() {
            self.mark_dirty();
            info!(removed = stale.len(), keys = ?stale, "Evicted stale long-term memory");
        }
        stale
    }

    // ── Snapshots ───────────────────────────────────────────────

    pub fn snapshot(&self) -> MemoryState {
        MemoryState {
            short_term: ShortTermMemory {
                entries: self.short_term.snapshot(),
            },
            long_term: LongTermMemory {
                entries: self.long_term.snapshot(),
                last_accessed: self.last_accessed.snapshot(),
            },
        }
    }

    /// Replace both tiers with `state`.
    pub fn restore(&self, state: &MemoryState) {
        self.short_term.restore(state.short_term.entries.clone());
        self.long_term.restore(state.long_term.entries.clone());
        self.last_accessed.restore(state.long_term.last_accessed.clone());
        self.dirty.store(true, Ordering::SeqCst);
    }

    // ── Persistence ─────────────────────────────────────────────

    /// Load long-term memory from the configured file. Returns the number
    /// of entries loaded; a missing file or no configured path loads none.
    pub async fn load_long_term_memory(&self) -> Result<usize> {
        let Some(path) = self.settings.long_term_path.as_deref() else {
            return Ok(0);
        };
        let Some(file) = persist::read(path).await? else {
            return Ok(0);
        };

        let now = Utc::now();
        let mut last_accessed = file.last_accessed;
        for key in file.entries.keys() {
            last_accessed.entry(key.clone()).or_insert(now);
        }
        last_accessed.retain(|key, _| file.entries.contains_key(key));

        let count = file.entries.len();
        self.long_term.restore(file.entries);
        self.last_accessed.restore(last_accessed);
        self.dirty.store(false, Ordering::SeqCst);
        info!(path = %path.display(), entries = count, "Loaded long-term memory");
        Ok(count)
    }

    /// Persist long-term memory to the configured file.
    ///
    /// On failure the tier stays dirty so the next save point retries.
    pub async fn save_long_term_memory(&self) -> Result<()> {
        let Some(path) = self.settings.long_term_path.as_deref() else {
            return Ok(());
        };

        self.dirty.store(false, Ordering::SeqCst);
        let file = LongTermFile {
            entries: self.long_term.snapshot(),
            last_accessed: self.last_accessed.snapshot(),
        };
        match persist::write(path, &file).await {
            Ok(()) => {
                debug!(path = %path.display(), entries = file.entries.len(), "Saved long-term memory");
                Ok(())
            }
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Save only if long-term memory changed since the last save.
    /// Returns whether a save happened.
    pub async fn flush(&self) -> Result<bool> {
        if !self.is_dirty() {
            return Ok(false);
        }
        self.save_long_term_memory().await?;
        Ok(true)
    }

    /// `flush`, logging failures instead of returning them.
    pub async fn flush_or_warn(&self) {
        if let Err(e) = self.flush().await {
            warn!(error = %e, "Long-term memory not persisted, will retry at next save point");
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    // Lock order is `last_accessed` then `long_term`, here and in the
    // eviction paths.
    fn write_long_term(&self, key: &str, write: impl FnOnce(&StateManager)) {
        self.last_accessed.update_with(key, |_| {
            write(&self.long_term);
            Utc::now()
        });
        self.mark_dirty();
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new(MemorySettings::default())
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("settings", &self.settings)
            .field("long_term_keys", &self.long_term.keys())
            .finish()
    }
}

fn string_list(value: Option<Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relevance::word_count;
    use smartgraph_core::error::SmartGraphError;

    fn settings(cap: usize) -> MemorySettings {
        MemorySettings {
            history_cap: cap,
            context_turns: 5,
            long_term_path: None,
        }
    }

    #[test]
    fn test_short_term_defaults_and_passthrough() {
        let mm = MemoryManager::default();
        assert_eq!(mm.get_short_term(keys::LAST_INPUT), Some(json!("")));
        assert_eq!(mm.get_short_term(keys::CONTEXT), Some(json!({})));

        mm.update_short_term(keys::LAST_INPUT, json!("hello"));
        mm.update_short_term(keys::CONTEXT, json!({"topic": "rust"}));
        mm.update_short_term(keys::CONTEXT, json!({"mood": "curious"}));
        assert_eq!(mm.get_short_term(keys::LAST_INPUT), Some(json!("hello")));
        assert_eq!(
            mm.get_short_term(keys::CONTEXT),
            Some(json!({"topic": "rust", "mood": "curious"}))
        );

        mm.reset_short_term();
        assert_eq!(mm.get_short_term(keys::LAST_INPUT), Some(json!("")));
    }

    #[test]
    fn test_short_term_does_not_stamp() {
        let mm = MemoryManager::default();
        mm.update_short_term("scratch", json!(1));
        assert!(mm.last_accessed("scratch").is_none());
        assert!(!mm.is_dirty());
    }

    #[test]
    fn test_long_term_write_stamps_and_dirties() {
        let mm = MemoryManager::default();
        let before = Utc::now();
        mm.update_long_term("favorite_color", json!("green"));
        assert_eq!(mm.get_long_term("favorite_color"), Some(json!("green")));
        assert!(mm.last_accessed("favorite_color").unwrap() >= before);
        assert!(mm.is_dirty());
    }

    #[test]
    fn test_conversation_history_fifo_cap() {
        let mm = MemoryManager::new(settings(3));
        for i in 0..7 {
            mm.update_long_term(keys::CONVERSATION_HISTORY, json!(format!("turn {}", i)));
        }
        assert_eq!(
            mm.conversation_history(),
            vec!["turn 4", "turn 5", "turn 6"]
        );
        assert_eq!(mm.recent_turns(2), vec!["turn 5", "turn 6"]);
        assert_eq!(mm.recent_turns(10).len(), 3);
    }

    #[test]
    fn test_add_fact_dedupes() {
        let mm = MemoryManager::default();
        assert!(mm.add_fact("cats are pets"));
        assert!(!mm.add_fact("cats are pets"));
        assert!(mm.add_fact("stock market fell"));
        assert_eq!(mm.facts(), vec!["cats are pets", "stock market fell"]);
    }

    #[test]
    fn test_preferences_merge() {
        let mm = MemoryManager::default();
        mm.set_preference("tone", json!("formal"));
        mm.set_preference("language", json!("en"));
        mm.set_preference("tone", json!("casual"));
        let prefs = mm.preferences();
        assert_eq!(prefs.get("tone"), Some(&json!("casual")));
        assert_eq!(prefs.get("language"), Some(&json!("en")));
    }

    #[test]
    fn test_build_context_sections() {
        let mm = MemoryManager::default();
        mm.record_turn("user", "hi");
        mm.record_turn("assistant", "hello");
        mm.add_fact("cats are pets");
        mm.add_fact("stock market fell");
        mm.set_preference("tone", json!("friendly"));

        let ctx = mm.build_context("tell me about cats", 200);
        assert!(ctx.starts_with("Conversation:\nuser: hi\nassistant: hello"));
        assert!(ctx.contains("Relevant facts:\n- cats are pets"));
        assert!(!ctx.contains("stock market"));
        assert!(ctx.contains("User preferences:\ntone: friendly"));
    }

    #[test]
    fn test_build_context_only_last_k_turns() {
        let mm = MemoryManager::default();
        for i in 0..8 {
            mm.record_turn("user", &format!("message{}", i));
        }
        let ctx = mm.build_context("", 500);
        assert!(!ctx.contains("message2"));
        assert!(ctx.contains("message3"));
        assert!(ctx.contains("message7"));
    }

    #[test]
    fn test_build_context_empty_memory() {
        let mm = MemoryManager::default();
        assert_eq!(mm.build_context("anything", 100), "");
    }

    #[test]
    fn test_build_context_respects_budget() {
        let mm = MemoryManager::default();
        mm.record_turn("user", "What is the capital of France? I forgot it.");
        mm.record_turn("assistant", "The capital of France is Paris. It is lovely in spring");
        mm.add_fact("France borders Spain and Italy");

        for max in [3, 8, 12, 20] {
            let ctx = mm.build_context("France", max);
            assert!(word_count(&ctx) <= max);
        }

        let ctx = mm.build_context("France", 18);
        assert!(ctx.ends_with("Paris."), "got {:?}", ctx);
    }

    #[test]
    fn test_cleanup_removes_stale_and_is_idempotent() {
        let mm = MemoryManager::default();
        mm.update_long_term("old", json!(1));
        mm.update_long_term("fresh", json!(2));
        mm.last_accessed
            .update("old", Utc::now() - chrono::Duration::hours(2));

        let removed = mm.cleanup_long_term_memory(Duration::from_secs(3600));
        assert_eq!(removed, vec!["old"]);
        assert_eq!(mm.get_long_term("old"), None);
        assert!(mm.last_accessed("old").is_none());
        assert_eq!(mm.get_long_term("fresh"), Some(json!(2)));

        let again = mm.cleanup_long_term_memory(Duration::from_secs(3600));
        assert!(again.is_empty());
    }

    #[test]
    fn test_cleanup_racing_writes_leaves_no_orphans() {
        let mm = Arc::new(MemoryManager::default());

        let writer = {
            let mm = Arc::clone(&mm);
            std::thread::spawn(move || {
                for i in 0..500 {
                    mm.update_long_term("hot", json!(i));
                }
            })
        };
        let sweeper = {
            let mm = Arc::clone(&mm);
            std::thread::spawn(move || {
                for _ in 0..500 {
                    mm.cleanup_long_term_memory(Duration::ZERO);
                }
            })
        };
        writer.join().unwrap();
        sweeper.join().unwrap();

        // Every surviving entry is stamped and every stamp has an entry.
        assert_eq!(
            mm.get_long_term("hot").is_some(),
            mm.last_accessed("hot").is_some()
        );

        mm.update_long_term("hot", json!("last"));
        assert_eq!(mm.get_long_term("hot"), Some(json!("last")));
        assert!(mm.last_accessed("hot").is_some());
    }

    #[test]
    fn test_cleanup_huge_ttl_removes_nothing() {
        let mm = MemoryManager::default();
        mm.update_long_term("k", json!(1));
        assert!(mm.cleanup_long_term_memory(Duration::MAX).is_empty());
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let mm = MemoryManager::default();
        mm.update_short_term(keys::LAST_INPUT, json!("q"));
        mm.add_fact("water is wet");
        mm.record_turn("user", "q");

        let snap = mm.snapshot();
        let other = MemoryManager::default();
        other.restore(&snap);
        assert_eq!(other.snapshot(), snap);
        assert_eq!(other.facts(), vec!["water is wet"]);
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long_term.json");
        let settings = MemorySettings {
            long_term_path: Some(path.clone()),
            ..MemorySettings::default()
        };

        let mm = MemoryManager::new(settings.clone());
        mm.add_fact("the user likes tea");
        mm.set_preference("units", json!("metric"));
        mm.update_short_term(keys::LAST_INPUT, json!("not persisted"));
        assert!(mm.flush().await.unwrap());
        assert!(!mm.is_dirty());
        assert!(!mm.flush().await.unwrap());

        let reloaded = MemoryManager::new(settings);
        assert_eq!(reloaded.load_long_term_memory().await.unwrap(), 2);
        assert_eq!(reloaded.facts(), vec!["the user likes tea"]);
        assert_eq!(reloaded.get_short_term(keys::LAST_INPUT), Some(json!("")));
        assert_eq!(
            reloaded.last_accessed(keys::FACTS),
            mm.last_accessed(keys::FACTS)
        );
    }

    #[tokio::test]
    async fn test_load_stamps_unstamped_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long_term.json");
        std::fs::write(&path, r#"{"entries": {"facts": ["hand written"]}}"#).unwrap();

        let mm = MemoryManager::new(MemorySettings {
            long_term_path: Some(path),
            ..MemorySettings::default()
        });
        assert_eq!(mm.load_long_term_memory().await.unwrap(), 1);
        assert!(mm.last_accessed(keys::FACTS).is_some());
    }

    #[tokio::test]
    async fn test_failed_save_stays_dirty() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes the rename fail.
        let path = dir.path().join("occupied");
        std::fs::create_dir_all(path.join("child")).unwrap();

        let mm = MemoryManager::new(MemorySettings {
            long_term_path: Some(path),
            ..MemorySettings::default()
        });
        mm.add_fact("x");
        let err = mm.save_long_term_memory().await.unwrap_err();
        assert!(matches!(err, SmartGraphError::Memory(_)));
        assert!(mm.is_dirty());
    }

    #[tokio::test]
    async fn test_no_path_is_noop() {
        let mm = MemoryManager::default();
        mm.add_fact("x");
        assert_eq!(mm.load_long_term_memory().await.unwrap(), 0);
        mm.save_long_term_memory().await.unwrap();
    }
}
