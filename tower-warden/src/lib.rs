//! Tower middleware integration for pulse-warden
//!
//! [`WardenLayer`] turns every HTTP request into tracked work:
//!
//! 1. the request is classified (request id, session, user, service) and
//!    registered with the warden's registry for as long as its response
//!    future lives;
//! 2. the flood sensor decides admission; refused requests are answered with
//!    `429 Too Many Requests` and a `Retry-After` header without reaching the
//!    inner service;
//! 3. admitted requests run inside the work's execution frame, so
//!    `pulse_warden::kill_runaway()` and the task decorator see them;
//! 4. a request killed by the zombie detector, or whose handler returns a
//!    [`ZombieAbort`], is answered with `504 Gateway Timeout`.
//!
//! # Examples
//!
//! ```rust
//! use std::convert::Infallible;
//! use std::sync::Arc;
//!
//! use http::{Request, Response};
//! use pulse_warden::{Warden, WardenConfig};
//! use tower::{ServiceBuilder, service_fn};
//! use tower_warden::WardenLayer;
//!
//! async fn handle(_req: Request<()>) -> Result<Response<()>, Infallible> {
//!     pulse_warden::kill_runaway().ok();
//!     Ok(Response::new(()))
//! }
//!
//! let warden = Arc::new(Warden::from_config(WardenConfig::default()).unwrap());
//! let service = ServiceBuilder::new()
//!     .layer(WardenLayer::new(warden))
//!     .service(service_fn(handle));
//! # drop(service);
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![warn(rust_2018_idioms)]

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::ready;
use http::header::{HeaderValue, RETRY_AFTER};
use http::{Request, Response, StatusCode};
use pin_project_lite::pin_project;
use serde::{Deserialize, Serialize};
use tokio_util::sync::WaitForCancellationFutureOwned;
use tower::{Layer, Service};

use pulse_warden::context::{self, Frame, Scoped};
use pulse_warden::events::{Event, EventSink};
use pulse_warden::flood::{Admission, Rejection};
use pulse_warden::ids::{IdGenerator, default_ids};
use pulse_warden::registry::Ticket;
use pulse_warden::work::{Work, WorkKind};

// Re-export core types
pub use pulse_warden::{Warden, WardenConfig, ZombieAbort};

/// Boxed error, as produced by most Tower middleware
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// How requests are classified into work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenLayerConfig {
    /// Header carrying a caller-supplied request id (default: `x-request-id`)
    pub request_id_header: String,
    /// Header carrying the session key (default: `x-session-id`)
    pub session_header: String,
    /// Header carrying the authenticated user (default: `x-remote-user`)
    pub user_header: String,
    /// Header carrying the target service; the first path segment is used
    /// when unset or absent
    pub service_header: Option<String>,
    /// Maximum request time in milliseconds; the warden's default when unset
    pub max_time_ms: Option<u64>,
}

impl Default for WardenLayerConfig {
    fn default() -> Self {
        Self {
            request_id_header: "x-request-id".to_string(),
            session_header: "x-session-id".to_string(),
            user_header: "x-remote-user".to_string(),
            service_header: None,
            max_time_ms: None,
        }
    }
}

/// Tower layer tracking every request as pulse-warden work
#[derive(Clone)]
pub struct WardenLayer {
    warden: Arc<Warden>,
    config: Arc<WardenLayerConfig>,
    ids: Arc<dyn IdGenerator>,
}

impl WardenLayer {
    /// Create layer with default classification
    pub fn new(warden: Arc<Warden>) -> Self {
        Self::with_config(warden, WardenLayerConfig::default())
    }

    /// Create layer with custom classification
    pub fn with_config(warden: Arc<Warden>, config: WardenLayerConfig) -> Self {
        Self {
            warden,
            config: Arc::new(config),
            ids: default_ids(),
        }
    }

    /// Replaces the generator used when a request carries no id
    #[must_use]
    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Get warden for registry and metrics access
    pub fn warden(&self) -> &Arc<Warden> {
        &self.warden
    }

    /// Get classification settings
    pub fn config(&self) -> &WardenLayerConfig {
        &self.config
    }

    fn max_time(&self) -> Duration {
        self.config
            .max_time_ms
            .map_or_else(|| self.warden.default_max_time(), Duration::from_millis)
    }

    fn classify<B>(&self, request: &Request<B>) -> Arc<Work> {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        let id = header(&self.config.request_id_header).unwrap_or_else(|| self.ids.next_id());
        let mut builder = Work::builder(id)
            .kind(WorkKind::Request)
            .name(format!("{} {}", request.method(), request.uri().path()))
            .max_time(self.max_time());

        if let Some(session) = header(&self.config.session_header) {
            builder = builder.session(session);
        }
        if let Some(user) = header(&self.config.user_header) {
            builder = builder.user(user);
        }
        let service = self
            .config
            .service_header
            .as_deref()
            .and_then(header)
            .or_else(|| first_segment(request.uri().path()));
        if let Some(service) = service {
            builder = builder.service(service);
        }

        builder.build()
    }
}

impl std::fmt::Debug for WardenLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WardenLayer")
            .field("config", &self.config)
            .field("ids", &self.ids)
            .finish_non_exhaustive()
    }
}

impl<S> Layer<S> for WardenLayer {
    type Service = WardenService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        WardenService {
            inner,
            layer: self.clone(),
        }
    }
}

/// Tower service wrapper that registers, admits and times out requests
#[derive(Clone, Debug)]
pub struct WardenService<S> {
    inner: S,
    layer: WardenLayer,
}

impl<S> WardenService<S> {
    /// Get reference to inner service
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Get mutable reference to inner service
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Get warden for registry and metrics access
    pub fn warden(&self) -> &Arc<Warden> {
        &self.layer.warden
    }
}

impl<S, ReqB, ResB> Service<Request<ReqB>> for WardenService<S>
where
    S: Service<Request<ReqB>, Response = Response<ResB>>,
    S::Error: 'static,
    ResB: Default,
{
    type Response = Response<ResB>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future, ResB>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<ReqB>) -> Self::Future {
        let warden = &self.layer.warden;
        let work = self.layer.classify(&request);

        let frame = Frame::for_request(work.id()).into_shared();
        let ticket = warden.registry().create_in(&frame, work.clone());

        if let Admission::RetryLater(rejection) = warden.sensor().may_proceed(Some(&work)) {
            work.set_success(false);
            // The ticket drops here, so refused requests leave the registry at once
            return ResponseFuture::rejected(rejection);
        }
        warden.metrics().record_admitted();

        #[cfg(feature = "tracing")]
        {
            use pulse_warden::registry::WorkRegistry;
            tracing::debug!(
                request_id = work.id(),
                name = work.name(),
                outstanding = warden.registry().len(),
                "Request admitted"
            );
        }

        request.extensions_mut().insert(work.clone());
        let cancelled = work.cancellation().clone().cancelled_owned();
        let inner = context::sync_scope_shared(frame.clone(), || self.inner.call(request));

        ResponseFuture {
            state: State::Running {
                inner: context::scope_shared(frame, inner),
                cancelled,
                ticket,
                work,
                sink: warden.sink().clone(),
            },
            _body: PhantomData,
        }
    }
}

pin_project! {
    #[project = StateProj]
    enum State<F> {
        Rejected {
            rejection: Rejection,
        },
        Running {
            #[pin]
            inner: Scoped<F>,
            #[pin]
            cancelled: WaitForCancellationFutureOwned,
            ticket: Ticket,
            work: Arc<Work>,
            sink: Arc<dyn EventSink>,
        },
    }
}

pin_project! {
    /// Response future of [`WardenService`]
    ///
    /// Holds the request's registration until it completes or is dropped.
    pub struct ResponseFuture<F, B> {
        #[pin]
        state: State<F>,
        _body: PhantomData<fn() -> B>,
    }
}

impl<F, B> ResponseFuture<F, B> {
    fn rejected(rejection: Rejection) -> Self {
        Self {
            state: State::Rejected { rejection },
            _body: PhantomData,
        }
    }
}

impl<F, B, E> Future for ResponseFuture<F, B>
where
    F: Future<Output = Result<Response<B>, E>>,
    B: Default,
    E: 'static,
{
    type Output = Result<Response<B>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let (inner, cancelled, ticket, work, sink) = match self.project().state.project() {
            StateProj::Rejected { rejection } => return Poll::Ready(Ok(too_many_requests(rejection))),
            StateProj::Running {
                inner,
                cancelled,
                ticket,
                work,
                sink,
            } => (inner, cancelled, ticket, work, sink),
        };

        // A killed request is answered at its next await point
        if cancelled.poll(cx).is_ready() {
            let response = gateway_timeout(work, &ZombieAbort::of(work), sink.as_ref());
            ticket.close();
            return Poll::Ready(Ok(response));
        }

        let result = ready!(inner.poll(cx));
        let result = match result {
            Ok(mut response) => {
                if let Some(abort) = response.extensions().get::<ZombieAbort>().cloned() {
                    sink.on_event(&Event::Aborted { abort: &abort });
                    work.set_success(false);
                    *response.status_mut() = StatusCode::GATEWAY_TIMEOUT;
                } else {
                    work.set_success(!response.status().is_server_error());
                }
                Ok(response)
            }
            Err(error) => match as_abort(&error) {
                Some(abort) => Ok(gateway_timeout(work, &abort, sink.as_ref())),
                None => {
                    work.set_success(false);
                    Err(error)
                }
            },
        };

        ticket.close();
        Poll::Ready(result)
    }
}

/// Response for a request whose handler hit a zombie checkpoint
///
/// Handlers that cannot return errors (axum handlers, for instance) return
/// this instead; the layer logs the abort and keeps the 504 status.
pub fn abort_response<B: Default>(abort: ZombieAbort) -> Response<B> {
    let mut response = Response::new(B::default());
    *response.status_mut() = StatusCode::GATEWAY_TIMEOUT;
    response.extensions_mut().insert(abort);
    response
}

fn too_many_requests<B: Default>(rejection: &Rejection) -> Response<B> {
    let mut response = Response::new(B::default());
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    // A zero wait would invite an immediate retry
    let secs = rejection.retry_after.as_secs().max(1);
    response.headers_mut().insert(RETRY_AFTER, HeaderValue::from(secs));
    response.extensions_mut().insert(rejection.clone());
    response
}

fn gateway_timeout<B: Default>(work: &Work, abort: &ZombieAbort, sink: &dyn EventSink) -> Response<B> {
    sink.on_event(&Event::Aborted { abort });
    work.set_success(false);
    abort_response(abort.clone())
}

fn as_abort<E: 'static>(error: &E) -> Option<ZombieAbort> {
    let error = error as &dyn Any;
    if let Some(abort) = error.downcast_ref::<ZombieAbort>() {
        return Some(abort.clone());
    }
    error
        .downcast_ref::<BoxError>()
        .and_then(|boxed| boxed.downcast_ref::<ZombieAbort>())
        .cloned()
}

fn first_segment(path: &str) -> Option<String> {
    path.split('/').find(|segment| !segment.is_empty()).map(str::to_string)
}

/// Metrics collector for the warden behind a layer
#[cfg(feature = "metrics")]
#[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
pub struct WardenMetricsRecorder {
    warden: Arc<Warden>,
}

#[cfg(feature = "metrics")]
impl WardenMetricsRecorder {
    /// Create new metrics collector
    pub fn new(warden: Arc<Warden>) -> Self {
        Self { warden }
    }

    /// Record current metrics to metrics registry
    pub fn record_metrics(&self) {
        use pulse_warden::registry::WorkRegistry;

        let registry = self.warden.registry();
        let zombies = registry.stream().filter(|work| work.is_zombie()).count();
        let snapshot = self.warden.metrics().snapshot();

        metrics::gauge!("pulse_warden_outstanding").set(registry.len() as f64);
        metrics::gauge!("pulse_warden_outstanding_zombies").set(zombies as f64);
        metrics::gauge!("pulse_warden_rejection_rate").set(snapshot.rejection_rate());
        metrics::counter!("pulse_warden_admitted").absolute(snapshot.admitted);
        metrics::counter!("pulse_warden_rejected").absolute(snapshot.rejected);
        metrics::counter!("pulse_warden_kills").absolute(snapshot.kills);
        metrics::counter!("pulse_warden_aborts").absolute(snapshot.aborts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderName;

    fn layer() -> WardenLayer {
        WardenLayer::new(Arc::new(Warden::from_config(WardenConfig::default()).unwrap()))
    }

    #[test]
    fn test_layer_config_defaults() {
        let config = WardenLayerConfig::default();
        assert_eq!(config.request_id_header, "x-request-id");
        assert_eq!(config.session_header, "x-session-id");
        assert_eq!(config.user_header, "x-remote-user");
        assert!(config.service_header.is_none());

        let parsed: WardenLayerConfig = serde_json::from_str(r#"{"max_time_ms": 2500}"#).unwrap();
        assert_eq!(parsed.max_time_ms, Some(2500));
        assert_eq!(parsed.user_header, "x-remote-user");
    }

    #[test]
    fn test_classify_reads_headers() {
        let layer = layer();
        let request = Request::builder()
            .method("POST")
            .uri("/reports/42?full=1")
            .header("x-request-id", "req-7")
            .header("x-session-id", " s-1 ")
            .header("x-remote-user", "")
            .body(())
            .unwrap();

        let work = layer.classify(&request);
        assert_eq!(work.id(), "req-7");
        assert_eq!(work.root_id(), "req-7");
        assert_eq!(work.kind(), WorkKind::Request);
        assert_eq!(work.name(), Some("POST /reports/42"));
        assert_eq!(work.session(), Some("s-1"));
        assert_eq!(work.user(), None);
        assert_eq!(work.service(), Some("reports"));
        assert_eq!(work.max_time(), layer.warden().default_max_time());
    }

    #[test]
    fn test_classify_custom_service_header() {
        let warden = layer().warden().clone();
        let config = WardenLayerConfig {
            service_header: Some("x-service".to_string()),
            max_time_ms: Some(1500),
            ..WardenLayerConfig::default()
        };
        let layer = WardenLayer::with_config(warden, config)
            .with_ids(Arc::new(pulse_warden::ids::SequentialIds::new("http")));

        let request = Request::builder()
            .uri("/")
            .header(HeaderName::from_static("x-service"), "billing")
            .body(())
            .unwrap();
        let work = layer.classify(&request);
        assert_eq!(work.id(), "http-1");
        assert_eq!(work.service(), Some("billing"));
        assert_eq!(work.max_time(), Duration::from_millis(1500));

        let bare = layer.classify(&Request::new(()));
        assert_eq!(bare.service(), None);
    }

    #[test]
    fn test_first_segment() {
        assert_eq!(first_segment("/a/b").as_deref(), Some("a"));
        assert_eq!(first_segment("//a").as_deref(), Some("a"));
        assert_eq!(first_segment("/"), None);
        assert_eq!(first_segment(""), None);
    }

    #[test]
    fn test_abort_detection() {
        let abort = ZombieAbort {
            id: "r".to_string(),
            root_id: "r".to_string(),
            elapsed: Duration::from_secs(2),
            max_time: Duration::from_secs(1),
        };
        assert_eq!(as_abort(&abort), Some(abort.clone()));

        let boxed: BoxError = Box::new(abort.clone());
        assert_eq!(as_abort(&boxed), Some(abort));

        let other: BoxError = "boom".into();
        assert_eq!(as_abort(&other), None);
        assert_eq!(as_abort(&std::io::Error::other("io")), None);
    }

    #[test]
    fn test_too_many_requests_headers() {
        let rejection = Rejection {
            limit: "USER".to_string(),
            message: "Too many requests for this user".to_string(),
            retry_after: Duration::from_secs(7),
        };
        let response: Response<()> = too_many_requests(&rejection);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "7");
        assert_eq!(response.extensions().get::<Rejection>(), Some(&rejection));
    }

    #[test]
    fn test_zero_wait_hint_becomes_one_second() {
        let rejection = Rejection {
            limit: "TOTAL".to_string(),
            message: "Too many concurrent requests".to_string(),
            retry_after: Duration::ZERO,
        };
        let response: Response<()> = too_many_requests(&rejection);
        assert_eq!(response.headers()[RETRY_AFTER], "1");
        assert_eq!(response.extensions().get::<Rejection>().unwrap().retry_after, Duration::ZERO);
    }
}
