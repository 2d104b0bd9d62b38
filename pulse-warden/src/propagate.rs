//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Context propagation for delegated work
//!
//! A [`Decorator`] wraps closures and futures that run on another thread or
//! task. The wrapper captures the caller's frame when it is created and, when
//! it runs, installs a child frame, creates a child [`Work`] that shares the
//! caller's root id, and reports the task's start and finish. Everything is
//! undone on every exit path, panics and future cancellation included.
//!
//! ```rust
//! use pulse_warden::context;
//! use pulse_warden::propagate::Decorator;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! context::put_field("tenant", "acme").unwrap();
//! let decorator = Decorator::new();
//!
//! let handle = decorator.spawn("index-rebuild", async {
//!     assert_eq!(context::field("task").as_deref(), Some("index-rebuild"));
//!     context::field("tenant")
//! });
//! assert_eq!(handle.await.unwrap().as_deref(), Some("acme"));
//! # }
//! ```

#![forbid(unsafe_code)]

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project_lite::pin_project;

use crate::clock::{Clock, system_clock};
use crate::context::{self, Frame, Scoped, SharedFrame};
use crate::events::{Event, EventSink, default_sink};
use crate::ids::{IdGenerator, default_ids};
use crate::registry::{Ticket, WorkRegistry};
use crate::work::{DEFAULT_MAX_TIME, Work, WorkKind};

/// Field naming the child work
pub const REQUEST_ID: &str = "request_id";
/// Field naming the top-level request
pub const ROOT_REQUEST_ID: &str = "root_request_id";
/// Field naming the parent work
pub const PARENT_REQUEST_ID: &str = "parent_request_id";
/// Field naming the task
pub const TASK: &str = "task";

/// Wraps delegated work so it carries its parent's identity
#[derive(Clone)]
pub struct Decorator {
    sink: Arc<dyn EventSink>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    max_time: Duration,
    registry: Option<Arc<dyn WorkRegistry>>,
}

impl Decorator {
    /// Decorator with the default sink, ids and clock
    #[must_use]
    pub fn new() -> Self {
        Self {
            sink: default_sink(),
            ids: default_ids(),
            clock: system_clock(),
            max_time: DEFAULT_MAX_TIME,
            registry: None,
        }
    }

    /// Also registers each child work in `registry` while it runs
    #[must_use]
    pub fn registering(mut self, registry: impl WorkRegistry + 'static) -> Self {
        self.registry = Some(Arc::new(registry));
        self
    }

    /// Replaces the event sink
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replaces the id generator
    #[must_use]
    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Replaces the clock child work measures time with
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Maximum time given to child work
    #[must_use]
    pub fn with_max_time(mut self, max_time: Duration) -> Self {
        self.max_time = max_time;
        self
    }

    /// Wraps a closure
    ///
    /// The caller's frame is captured now; the child work is created when the
    /// returned closure runs, on whatever thread that is. The running thread's
    /// own frame is untouched afterwards.
    pub fn decorate<F, R>(&self, name: impl Into<String>, f: F) -> impl FnOnce() -> R + Send + 'static
    where
        F: FnOnce() -> R + Send + 'static,
    {
        let launch = self.launch(name.into());
        move || {
            let frame = launch.frame.clone();
            context::sync_scope_shared(frame, move || {
                let mut guard = launch.start();
                let out = f();
                guard.succeeded = true;
                out
            })
        }
    }

    /// Wraps a future
    ///
    /// The future runs inside its own task-local frame. The child work is
    /// created on first poll.
    pub fn decorate_future<F: Future>(&self, name: impl Into<String>, fut: F) -> Decorated<F> {
        let launch = self.launch(name.into());
        let frame = launch.frame.clone();
        Decorated {
            inner: context::scope_shared(
                frame,
                Tracked {
                    launch: Some(launch),
                    guard: None,
                    inner: fut,
                },
            ),
        }
    }

    /// Spawns a decorated future on the current tokio runtime
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime, like [`tokio::spawn`].
    pub fn spawn<F>(&self, name: impl Into<String>, fut: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tokio::spawn(self.decorate_future(name, fut))
    }

    /// Runs a decorated closure on tokio's blocking pool
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime, like
    /// [`tokio::task::spawn_blocking`].
    pub fn spawn_blocking<F, R>(&self, name: impl Into<String>, f: F) -> tokio::task::JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(self.decorate(name, f))
    }

    fn launch(&self, name: String) -> Launch {
        Launch {
            name,
            frame: Frame::capture().into_shared(),
            decorator: self.clone(),
        }
    }
}

impl Default for Decorator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Decorator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decorator")
            .field("ids", &self.ids)
            .field("clock", &self.clock.name())
            .field("max_time", &self.max_time)
            .field("registering", &self.registry.is_some())
            .finish_non_exhaustive()
    }
}

// Captured parent state waiting to run
struct Launch {
    name: String,
    frame: SharedFrame,
    decorator: Decorator,
}

impl Launch {
    // Must run inside the child frame's scope
    fn start(self) -> Guard {
        let Decorator {
            sink,
            ids,
            clock,
            max_time,
            registry,
        } = self.decorator;

        let parent = self.frame.lock().innermost();
        let id = ids.next_id();
        let root_id = parent.as_ref().map_or_else(|| id.clone(), |p| p.root_id().to_string());
        let token = parent
            .as_ref()
            .map(|p| p.cancellation().child_token())
            .unwrap_or_default();

        let work = Work::builder(id.clone())
            .root_id(root_id.clone())
            .kind(WorkKind::Task)
            .name(self.name.clone())
            .max_time(max_time)
            .clock(clock)
            .token(token)
            .build();

        let fields = {
            let mut frame = self.frame.lock();
            frame.set_field(REQUEST_ID, id);
            frame.set_field(ROOT_REQUEST_ID, root_id);
            if let Some(parent) = &parent {
                frame.set_field(PARENT_REQUEST_ID, parent.id());
            }
            frame.set_field(TASK, self.name);
            frame.fields().clone()
        };

        let ticket = match &registry {
            Some(registry) => registry.create(Some(work.clone())),
            None => Ticket::noop(),
        };

        sink.on_event(&Event::TaskStarted {
            work: &work,
            fields: &fields,
        });

        Guard {
            work,
            sink,
            succeeded: false,
            _ticket: ticket,
        }
    }
}

// Reports the finish on drop; the ticket closes after the report
struct Guard {
    work: Arc<Work>,
    sink: Arc<dyn EventSink>,
    succeeded: bool,
    _ticket: Ticket,
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.work.set_success(self.succeeded);
        self.sink.on_event(&Event::TaskFinished {
            work: &self.work,
            elapsed: self.work.elapsed(),
            success: self.succeeded,
        });
    }
}

pin_project! {
    struct Tracked<F> {
        launch: Option<Launch>,
        guard: Option<Guard>,
        #[pin]
        inner: F,
    }
}

impl<F: Future> Future for Tracked<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if let Some(launch) = this.launch.take() {
            *this.guard = Some(launch.start());
        }

        let out = std::task::ready!(this.inner.poll(cx));
        if let Some(mut guard) = this.guard.take() {
            guard.succeeded = true;
        }
        Poll::Ready(out)
    }
}

pin_project! {
    /// Future returned by [`Decorator::decorate_future`]
    #[must_use = "futures do nothing unless polled"]
    pub struct Decorated<F> {
        #[pin]
        inner: Scoped<Tracked<F>>,
    }
}

impl<F: Future> Future for Decorated<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().inner.poll(cx)
    }
}

impl<F> fmt::Debug for Decorated<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decorated").finish_non_exhaustive()
    }
}
