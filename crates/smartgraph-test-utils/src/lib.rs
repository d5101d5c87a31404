//! Scripted collaborators and filesystem fixtures for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use smartgraph_core::error::{Result, SmartGraphError};
use smartgraph_core::traits::{ModelClient, Tool};
use smartgraph_core::types::*;

type Responder = dyn Fn(&CompletionRequest) -> Completion + Send + Sync;

/// A scripted reply for `MockModel`.
#[derive(Debug, Clone)]
pub enum MockReply {
    Reply(Completion),
    Fail(String),
}

struct MockModelInner {
    script: Mutex<VecDeque<MockReply>>,
    responder: Option<Box<Responder>>,
    fail_first: AtomicUsize,
    always_fail: bool,
    delay: Option<Duration>,
    timeout_secs: u64,
    requests: Mutex<Vec<CompletionRequest>>,
}

/// Model client that replays a script, then falls back to a responder.
///
/// Clones share state, so a test can keep a handle and inspect the
/// requests after handing a clone to the engine.
#[derive(Clone)]
pub struct MockModel {
    inner: Arc<MockModelInner>,
}

impl MockModel {
    fn build(
        script: Vec<MockReply>,
        responder: Option<Box<Responder>>,
        fail_first: usize,
        always_fail: bool,
    ) -> Self {
        Self {
            inner: Arc::new(MockModelInner {
                script: Mutex::new(script.into()),
                responder,
                fail_first: AtomicUsize::new(fail_first),
                always_fail,
                delay: None,
                timeout_secs: 60,
                requests: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Replies "mock response" to everything.
    pub fn new() -> Self {
        Self::build(Vec::new(), None, 0, false)
    }

    /// Replies with `texts` in order, then "mock response".
    pub fn scripted<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let script = texts
            .into_iter()
            .map(|t| MockReply::Reply(Completion::text(t)))
            .collect();
        Self::build(script, None, 0, false)
    }

    /// Replays arbitrary replies, including tool calls and failures.
    pub fn with_script(script: Vec<MockReply>) -> Self {
        Self::build(script, None, 0, false)
    }

    /// Computes each reply from the request.
    pub fn responding<F>(f: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Completion + Send + Sync + 'static,
    {
        Self::build(Vec::new(), Some(Box::new(f)), 0, false)
    }

    /// Fails the first `n` calls, then replies normally.
    pub fn failing_times(n: usize) -> Self {
        Self::build(Vec::new(), None, n, false)
    }

    /// Fails every call.
    pub fn always_failing() -> Self {
        Self::build(Vec::new(), None, 0, true)
    }

    /// Sleeps before replying. Only valid before the model is cloned.
    pub fn with_delay(mut self, delay: Duration, timeout_secs: u64) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.delay = Some(delay);
            inner.timeout_secs = timeout_secs;
        }
        self
    }

    pub fn call_count(&self) -> usize {
        self.requests().len()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.inner
            .requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn next_reply(&self, request: &CompletionRequest) -> MockReply {
        if self.inner.always_fail {
            return MockReply::Fail("mock model unavailable".into());
        }
        let remaining = self.inner.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.inner.fail_first.store(remaining - 1, Ordering::SeqCst);
            return MockReply::Fail("mock model unavailable".into());
        }
        if let Some(reply) = self
            .inner
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            return reply;
        }
        match &self.inner.responder {
            Some(f) => MockReply::Reply(f(request)),
            None => MockReply::Reply(Completion::text("mock response")),
        }
    }
}

impl Default for MockModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelClient for MockModel {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<Completion>> {
        Box::pin(async move {
            self.inner
                .requests
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(request.clone());
            if let Some(delay) = self.inner.delay {
                tokio::time::sleep(delay).await;
            }
            match self.next_reply(&request) {
                MockReply::Reply(c) => Ok(c),
                MockReply::Fail(msg) => Err(SmartGraphError::ModelRequest(msg)),
            }
        })
    }

    fn timeout_secs(&self) -> u64 {
        self.inner.timeout_secs
    }
}

struct MockToolInner {
    name: String,
    records: Vec<SearchRecord>,
    fail_first: AtomicUsize,
    delay: Option<Duration>,
    timeout_secs: u64,
    queries: Mutex<Vec<String>>,
}

/// Tool that returns fixed records and records the queries it saw.
#[derive(Clone)]
pub struct MockTool {
    inner: Arc<MockToolInner>,
}

impl MockTool {
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(MockToolInner {
                name: name.to_string(),
                records: Vec::new(),
                fail_first: AtomicUsize::new(0),
                delay: None,
                timeout_secs: 30,
                queries: Mutex::new(Vec::new()),
            }),
        }
    }

    fn edit(mut self, f: impl FnOnce(&mut MockToolInner)) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            f(inner);
        }
        self
    }

    pub fn with_records(self, records: Vec<SearchRecord>) -> Self {
        self.edit(|i| i.records = records)
    }

    pub fn failing_times(self, n: usize) -> Self {
        self.edit(|i| i.fail_first = AtomicUsize::new(n))
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.edit(|i| i.delay = Some(delay))
    }

    pub fn with_timeout_secs(self, secs: u64) -> Self {
        self.edit(|i| i.timeout_secs = secs)
    }

    pub fn queries(&self) -> Vec<String> {
        self.inner
            .queries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Tool for MockTool {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn description(&self) -> &str {
        "Mock tool for tests"
    }

    fn timeout_secs(&self) -> u64 {
        self.inner.timeout_secs
    }

    fn run(&self, query: &str, max_results: usize) -> BoxFuture<'_, Result<Vec<SearchRecord>>> {
        let query = query.to_string();
        Box::pin(async move {
            self.inner
                .queries
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(query);
            if let Some(delay) = self.inner.delay {
                tokio::time::sleep(delay).await;
            }
            let remaining = self.inner.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.inner.fail_first.store(remaining - 1, Ordering::SeqCst);
                return Err(SmartGraphError::ToolExecution {
                    tool: self.inner.name.clone(),
                    message: "mock tool unavailable".into(),
                });
            }
            Ok(self.inner.records.iter().take(max_results).cloned().collect())
        })
    }
}

/// A fresh temporary directory, removed on drop.
pub fn temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("failed to create temp dir")
}

/// Three records about Paris, for search-flow tests.
pub fn paris_records() -> Vec<SearchRecord> {
    vec![
        SearchRecord::new(
            "Paris - Wikipedia",
            "Paris is the capital and largest city of France.",
            "https://en.wikipedia.org/wiki/Paris",
        ),
        SearchRecord::new(
            "France",
            "France is a country in Western Europe.",
            "https://en.wikipedia.org/wiki/France",
        ),
        SearchRecord::new(
            "Visit Paris",
            "Travel guide for the French capital.",
            "https://example.com/paris",
        ),
    ]
}
