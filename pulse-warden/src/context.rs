#![forbid(unsafe_code)]

//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Per-execution-context frames
//!
//! A [`Frame`] holds what a logical execution context knows about itself:
//! the stack of work currently open on it (one stack shared by all
//! registries, entries tagged with their registry) and the logging fields
//! attached to it.
//!
//! Inside a task-local scope (see [`scope`] and [`sync_scope`]) the scoped
//! frame is used; elsewhere each OS thread has its own frame. Child contexts
//! never share a parent's frame: [`Frame::capture`] copies what the child
//! should inherit.
//!
//! ```rust
//! use pulse_warden::context::{self, Frame};
//!
//! context::put_field("tenant", "acme").unwrap();
//! let child = Frame::capture();
//! std::thread::spawn(move || {
//!     context::sync_scope(child, || {
//!         assert_eq!(context::field("tenant").as_deref(), Some("acme"));
//!     });
//! })
//! .join()
//! .unwrap();
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::WardenResult;
use crate::propagate::REQUEST_ID;
use crate::work::{Work, validate_key};

/// Logging fields that describe one call site and are never inherited
pub const RESERVED_KEYS: &[&str] = &["root_cause", "exception", "stack_trace", "elapsed_ms", "success"];

/// Frame shared between its context and the tickets opened on it
pub type SharedFrame = Arc<Mutex<Frame>>;

/// Future running inside a frame scope
pub type Scoped<F> = tokio::task::futures::TaskLocalFuture<SharedFrame, F>;

tokio::task_local! {
    static TASK_FRAME: SharedFrame;
}

thread_local! {
    static THREAD_FRAME: SharedFrame = Arc::new(Mutex::new(Frame::default()));
}

#[derive(Clone)]
pub(crate) struct Entry {
    pub(crate) registry: u64,
    pub(crate) seq: u64,
    pub(crate) work: Arc<Work>,
}

/// Execution-context state: open work and logging fields
#[derive(Clone, Default)]
pub struct Frame {
    entries: Vec<Entry>,
    fields: BTreeMap<String, String>,
}

impl Frame {
    /// Empty frame
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the calling context, as a child context should inherit it
    ///
    /// Keeps the innermost work of every registry and every field except
    /// [`RESERVED_KEYS`].
    #[must_use]
    pub fn capture() -> Self {
        current_frame().lock().fork()
    }

    /// Wraps the frame for use with [`scope_shared`] and tickets
    #[must_use]
    pub fn into_shared(self) -> SharedFrame {
        Arc::new(Mutex::new(self))
    }

    /// Innermost work of the frame, regardless of registry
    pub fn innermost(&self) -> Option<Arc<Work>> {
        self.entries.last().map(|entry| entry.work.clone())
    }

    /// Logging fields
    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    /// Sets a logging field after validating the key
    ///
    /// # Errors
    ///
    /// Fails when the key is not snake_case.
    pub fn insert_field(&mut self, key: &str, value: impl Into<String>) -> WardenResult<()> {
        validate_key(key)?;
        self.fields.insert(key.to_string(), value.into());
        Ok(())
    }

    /// Empty frame carrying only the `request_id` logging field
    #[must_use]
    pub fn for_request(id: impl Into<String>) -> Self {
        let mut frame = Self::new();
        frame.set_field(REQUEST_ID, id);
        frame
    }

    // Built-in keys are snake_case constants, so no validation error can occur
    pub(crate) fn set_field(&mut self, key: &'static str, value: impl Into<String>) {
        debug_assert!(validate_key(key).is_ok(), "invalid built-in key {key:?}");
        self.fields.insert(key.to_string(), value.into());
    }

    /// Number of open entries, across registries
    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    fn fork(&self) -> Self {
        let mut seen = Vec::new();
        let mut entries = Vec::new();
        for entry in self.entries.iter().rev() {
            if !seen.contains(&entry.registry) {
                seen.push(entry.registry);
                entries.push(entry.clone());
            }
        }
        entries.reverse();

        let fields = self
            .fields
            .iter()
            .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Self { entries, fields }
    }

    pub(crate) fn push(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    pub(crate) fn remove(&mut self, registry: u64, seq: u64) {
        // Usually the top entry; search handles out-of-order closes
        if let Some(pos) = self
            .entries
            .iter()
            .rposition(|entry| entry.registry == registry && entry.seq == seq)
        {
            self.entries.remove(pos);
        }
    }

    pub(crate) fn current_for(&self, registry: u64) -> Option<Arc<Work>> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.registry == registry)
            .map(|entry| entry.work.clone())
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("entries", &self.entries.iter().map(|e| e.work.id()).collect::<Vec<_>>())
            .field("fields", &self.fields)
            .finish()
    }
}

/// Frame of the calling context
pub fn current_frame() -> SharedFrame {
    TASK_FRAME
        .try_with(Arc::clone)
        .unwrap_or_else(|_| THREAD_FRAME.try_with(Arc::clone).unwrap_or_default())
}

/// True when called inside a task-local frame scope
pub fn in_scope() -> bool {
    TASK_FRAME.try_with(|_| ()).is_ok()
}

/// Runs `fut` with `frame` as its execution context
pub fn scope<F: Future>(frame: Frame, fut: F) -> Scoped<F> {
    TASK_FRAME.scope(frame.into_shared(), fut)
}

/// Runs `fut` inside an existing shared frame
pub fn scope_shared<F: Future>(frame: SharedFrame, fut: F) -> Scoped<F> {
    TASK_FRAME.scope(frame, fut)
}

/// Runs `f` with `frame` as its execution context
///
/// The previous context is restored when `f` returns or unwinds.
pub fn sync_scope<R>(frame: Frame, f: impl FnOnce() -> R) -> R {
    TASK_FRAME.sync_scope(frame.into_shared(), f)
}

/// Runs `f` inside an existing shared frame
pub fn sync_scope_shared<R>(frame: SharedFrame, f: impl FnOnce() -> R) -> R {
    TASK_FRAME.sync_scope(frame, f)
}

/// Innermost work of the calling context, regardless of registry
pub fn innermost() -> Option<Arc<Work>> {
    current_frame().lock().innermost()
}

/// Logging field of the calling context
pub fn field(key: &str) -> Option<String> {
    current_frame().lock().fields.get(key).cloned()
}

/// All logging fields of the calling context
pub fn fields() -> BTreeMap<String, String> {
    current_frame().lock().fields.clone()
}

/// Sets a logging field on the calling context
///
/// # Errors
///
/// Fails when the key is not snake_case.
pub fn put_field(key: &str, value: impl Into<String>) -> WardenResult<()> {
    current_frame().lock().insert_field(key, value)
}

/// Removes every field and entry from the calling context
pub fn clear() {
    let frame = current_frame();
    let mut frame = frame.lock();
    frame.entries.clear();
    frame.fields.clear();
}
