//! Outstanding-work registry
//!
//! The registry is the set of all open [`Ticket`]s. Entries live in a
//! lock-free ordered skip map keyed by a monotonically increasing ticket
//! sequence, so iteration never blocks writers and always yields the
//! longest-lived work first.
//!
//! Creating a ticket also pushes the work onto the calling context's frame,
//! which is what [`WorkRegistry::current`] reads. Closing the ticket pops it
//! from that same frame, wherever the close happens.
//!
//! ```rust
//! use pulse_warden::registry::{Outstanding, WorkRegistry};
//! use pulse_warden::work::Work;
//!
//! let registry = Outstanding::new();
//! {
//!     let _ticket = registry.create(Work::builder("req-1").build());
//!     assert_eq!(registry.current().unwrap().id(), "req-1");
//!     assert_eq!(registry.len(), 1);
//! }
//! assert!(registry.current().is_none());
//! assert!(registry.is_empty());
//! ```

#![forbid(unsafe_code)]

//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_skiplist::SkipMap;

use crate::context::{self, Entry, SharedFrame};
use crate::error::WardenResult;
use crate::work::{Work, WorkKind, validate_key};

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Read and write interface shared by registries and their views
pub trait WorkRegistry: Send + Sync {
    /// Registers `work` and makes it current on the calling context
    ///
    /// `None` yields a no-op ticket. [`Outstanding`] and [`Filtered`] also
    /// have an inherent `create` taking `Arc<Work>` directly.
    fn create(&self, work: Option<Arc<Work>>) -> Ticket;

    /// Lazy, weakly consistent view of registered work, oldest first
    fn stream(&self) -> Stream<'_>;

    /// Innermost work of the calling context visible through this registry
    fn current(&self) -> Option<Arc<Work>>;

    /// Adds a logging field to the current work and the calling context
    ///
    /// Returns the value back to the caller.
    ///
    /// # Errors
    ///
    /// Fails fast when the key is empty or not snake_case.
    fn put_in_context(&self, key: &str, value: String) -> WardenResult<String> {
        validate_key(key)?;
        if let Some(work) = self.current() {
            work.put(key, value.clone())?;
        }
        context::put_field(key, value.clone())?;
        Ok(value)
    }

    /// Number of registered work items visible through this registry
    fn len(&self) -> usize {
        self.stream().count()
    }

    /// True when nothing is visible through this registry
    fn is_empty(&self) -> bool {
        self.stream().next().is_none()
    }
}

/// Iterator over registered work
pub struct Stream<'a> {
    inner: Box<dyn Iterator<Item = Arc<Work>> + 'a>,
}

impl<'a> Stream<'a> {
    fn new(inner: impl Iterator<Item = Arc<Work>> + 'a) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }
}

impl Iterator for Stream<'_> {
    type Item = Arc<Work>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl fmt::Debug for Stream<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream").finish_non_exhaustive()
    }
}

struct Inner {
    id: u64,
    entries: SkipMap<u64, Arc<Work>>,
    next_seq: AtomicU64,
}

/// The physical registry
///
/// Cloning is cheap and every clone refers to the same set of tickets.
#[derive(Clone)]
pub struct Outstanding {
    inner: Arc<Inner>,
}

impl Outstanding {
    /// Creates an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
                entries: SkipMap::new(),
                next_seq: AtomicU64::new(1),
            }),
        }
    }

    /// Registers `work` on the calling context
    ///
    /// Accepts `Arc<Work>` or `Option<Arc<Work>>`; `None` gives a no-op
    /// ticket.
    pub fn create(&self, work: impl Into<Option<Arc<Work>>>) -> Ticket {
        self.register(work.into(), context::current_frame())
    }

    /// Registers `work` on an explicit frame instead of the calling context
    ///
    /// Used by boundaries that prepare a frame before the work's future
    /// starts running.
    pub fn create_in(&self, frame: &SharedFrame, work: Arc<Work>) -> Ticket {
        self.register(Some(work), frame.clone())
    }

    /// View of this registry restricted to one kind of work
    #[must_use]
    pub fn filtered(&self, kind: WorkKind) -> Filtered {
        Filtered::new(self.clone(), kind)
    }

    /// Copy of the registered work, oldest first
    pub fn snapshot(&self) -> Vec<Arc<Work>> {
        self.stream().collect()
    }

    /// Process-unique registry identifier
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    fn register(&self, work: Option<Arc<Work>>, frame: SharedFrame) -> Ticket {
        let Some(work) = work else {
            return Ticket::noop();
        };

        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        self.inner.entries.insert(seq, work.clone());
        frame.lock().push(Entry {
            registry: self.inner.id,
            seq,
            work: work.clone(),
        });

        #[cfg(feature = "tracing")]
        tracing::trace!(request_id = work.id(), seq, "Work registered");

        Ticket {
            slot: Some(Slot {
                registry: self.inner.clone(),
                seq,
                frame,
                work,
            }),
        }
    }
}

impl Default for Outstanding {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Outstanding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outstanding")
            .field("id", &self.inner.id)
            .field("open", &self.inner.entries.len())
            .finish()
    }
}

impl WorkRegistry for Outstanding {
    fn create(&self, work: Option<Arc<Work>>) -> Ticket {
        self.register(work, context::current_frame())
    }

    fn stream(&self) -> Stream<'_> {
        Stream::new(self.inner.entries.iter().map(|entry| entry.value().clone()))
    }

    fn current(&self) -> Option<Arc<Work>> {
        context::current_frame().lock().current_for(self.inner.id)
    }

    fn len(&self) -> usize {
        self.inner.entries.len()
    }

    fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }
}

/// A view of an [`Outstanding`] registry restricted to one [`WorkKind`]
///
/// Registration goes to the shared base; reads only see matching work.
#[derive(Clone, Debug)]
pub struct Filtered {
    base: Outstanding,
    kind: WorkKind,
}

impl Filtered {
    /// Wraps `base`, exposing only work of `kind`
    #[must_use]
    pub fn new(base: Outstanding, kind: WorkKind) -> Self {
        Self { base, kind }
    }

    /// Registers `work` on the shared base registry
    pub fn create(&self, work: impl Into<Option<Arc<Work>>>) -> Ticket {
        self.base.create(work)
    }

    /// Kind exposed by this view
    pub fn kind(&self) -> WorkKind {
        self.kind
    }

    /// Underlying registry
    pub fn base(&self) -> &Outstanding {
        &self.base
    }
}

impl WorkRegistry for Filtered {
    fn create(&self, work: Option<Arc<Work>>) -> Ticket {
        self.base.register(work, context::current_frame())
    }

    fn stream(&self) -> Stream<'_> {
        let kind = self.kind;
        Stream::new(self.base.stream().filter(move |work| work.kind() == kind))
    }

    fn current(&self) -> Option<Arc<Work>> {
        self.base.current().filter(|work| work.kind() == self.kind)
    }
}

struct Slot {
    registry: Arc<Inner>,
    seq: u64,
    frame: SharedFrame,
    work: Arc<Work>,
}

/// Open registration of one work item
///
/// Dropping the ticket closes it, so the registration ends on every exit
/// path of the scope that holds it.
#[must_use = "dropping a ticket deregisters its work immediately"]
pub struct Ticket {
    slot: Option<Slot>,
}

impl Ticket {
    /// Ticket that owns nothing
    pub fn noop() -> Self {
        Self { slot: None }
    }

    /// Deregisters the work and restores the previous current work
    ///
    /// Further calls do nothing.
    pub fn close(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        slot.registry.entries.remove(&slot.seq);
        slot.frame.lock().remove(slot.registry.id, slot.seq);

        #[cfg(feature = "tracing")]
        tracing::trace!(request_id = slot.work.id(), seq = slot.seq, "Work deregistered");
    }

    /// True until closed; always false for a no-op ticket
    pub fn is_open(&self) -> bool {
        self.slot.is_some()
    }

    /// The registered work, while open
    pub fn work(&self) -> Option<&Arc<Work>> {
        self.slot.as_ref().map(|slot| &slot.work)
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.slot {
            Some(slot) => f
                .debug_struct("Ticket")
                .field("seq", &slot.seq)
                .field("work", &slot.work.id())
                .finish(),
            None => f.write_str("Ticket(closed)"),
        }
    }
}
