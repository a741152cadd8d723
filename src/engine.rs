//! Request handling.
//!
//! For every request the engine selects one response from the
//! [`ResponseSet`], then runs two independent branches: the capture branch
//! snapshots the request and persists it on a spawned task, and the response
//! branch renders the selected reply. A failure on one branch is logged and
//! never affects the other.
//!
//! Request tasks started with [`Engine::spawn_handle`] and capture writes are
//! tracked, and [`Engine::wait_for_captures`] waits for all of them.

use crate::capture::CapturedRequest;
use crate::config::ServerConfig;
use crate::error::CaptureError;
use crate::response::ResponseSet;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Body;
use hyper::header::HOST;
use hyper::Request;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Request counters, shared with the capture tasks.
#[derive(Debug, Default)]
struct Stats {
    requests_total: AtomicU64,
    captures_written: AtomicU64,
    captures_skipped: AtomicU64,
    capture_failures: AtomicU64,
}

/// Outcome of dispatching one request.
pub struct Dispatched {
    /// Reply for the client
    pub response: hyper::Response<Full<Bytes>>,
    /// Whether a write of the captured request was started
    pub captured: bool,
}

/// Dispatch and capture engine.
pub struct Engine {
    responses: ResponseSet,
    capture_dir: PathBuf,
    max_request_size: u64,
    read_timeout: Option<Duration>,
    stats: Arc<Stats>,
    pending: Mutex<JoinSet<()>>,
}

impl Engine {
    /// Create an engine. Rules that fail to build are logged and left out.
    pub fn new(config: &ServerConfig) -> Self {
        let responses = ResponseSet::from_configs(&config.responses);

        info!(
            rules = responses.len(),
            capture_dir = %config.capture_dir.display(),
            max_request_size = config.max_request_size,
            "Engine initialized"
        );

        Self {
            responses,
            capture_dir: config.capture_dir.clone(),
            max_request_size: config.max_request_size,
            read_timeout: config.read_timeout(),
            stats: Arc::new(Stats::default()),
            pending: Mutex::new(JoinSet::new()),
        }
    }

    pub fn responses(&self) -> &ResponseSet {
        &self.responses
    }

    /// Select a response, capture the request unless the response opts out,
    /// and render the reply.
    pub async fn dispatch<B>(&self, request: Request<B>, remote: Option<SocketAddr>) -> Dispatched
    where
        B: Body<Data = Bytes>,
        B::Error: Display,
    {
        self.stats.requests_total.fetch_add(1, Ordering::Relaxed);

        let selected = self
            .responses
            .find(request.method().as_str(), request.uri().path());

        debug!(
            method = %request.method(),
            path = %request.uri().path(),
            status = selected.status_code(),
            "Response selected"
        );

        let captured = if selected.skip_capture() {
            self.stats.captures_skipped.fetch_add(1, Ordering::Relaxed);
            let host = request
                .headers()
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .unwrap_or_default();
            info!(
                url = %request.uri(),
                host = %host,
                remote = ?remote,
                "Capture skipped"
            );
            false
        } else {
            self.capture(request, remote).await
        };

        Dispatched {
            response: selected.to_http(),
            captured,
        }
    }

    /// Service entry point.
    pub async fn handle<B>(
        &self,
        request: Request<B>,
        remote: Option<SocketAddr>,
    ) -> hyper::Response<Full<Bytes>>
    where
        B: Body<Data = Bytes>,
        B::Error: Display,
    {
        self.dispatch(request, remote).await.response
    }

    /// Handle `request` on a task tracked by the engine. The capture
    /// completes even if the receiver is dropped before the reply arrives.
    pub fn spawn_handle<B>(
        self: &Arc<Self>,
        request: Request<B>,
        remote: Option<SocketAddr>,
    ) -> oneshot::Receiver<hyper::Response<Full<Bytes>>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Display + Send,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let engine = Arc::clone(self);
        self.track(async move {
            let response = engine.handle(request, remote).await;
            if reply_tx.send(response).is_err() {
                debug!("Reply dropped, client gone");
            }
        });
        reply_rx
    }

    /// Wait until every request task and capture write started so far, and
    /// any started while waiting, has finished.
    pub async fn wait_for_captures(&self) {
        loop {
            let mut pending = std::mem::take(&mut *self.pending_tasks());
            if pending.is_empty() {
                return;
            }
            while let Some(result) = pending.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "Engine task failed");
                }
            }
        }
    }

    fn pending_tasks(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn track<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut pending = self.pending_tasks();
        // Reap finished tasks so the set only holds live ones.
        while let Some(result) = pending.try_join_next() {
            if let Err(e) = result {
                error!(error = %e, "Engine task failed");
            }
        }
        pending.spawn(task);
    }

    async fn capture<B>(&self, request: Request<B>, remote: Option<SocketAddr>) -> bool
    where
        B: Body<Data = Bytes>,
        B::Error: Display,
    {
        let snapshot = CapturedRequest::from_request(request, remote, self.max_request_size);
        let result = match self.read_timeout {
            Some(limit) => tokio::time::timeout(limit, snapshot)
                .await
                .unwrap_or_else(|_| Err(CaptureError::Read("timed out".to_string()))),
            None => snapshot.await,
        };

        let captured = match result {
            Ok(captured) => captured,
            Err(e) => {
                self.stats.capture_failures.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "Unable to capture the request");
                return false;
            }
        };

        let dir = self.capture_dir.clone();
        let stats = Arc::clone(&self.stats);
        self.track(async move {
            match captured.save_to(&dir).await {
                Ok(path) => {
                    stats.captures_written.fetch_add(1, Ordering::Relaxed);
                    debug!(path = %path.display(), "Request captured");
                }
                Err(e) => {
                    stats.capture_failures.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "Unable to save the captured request");
                }
            }
        });
        true
    }

    /// Get total requests dispatched.
    pub fn total_requests(&self) -> u64 {
        self.stats.requests_total.load(Ordering::Relaxed)
    }

    /// Get total capture files written.
    pub fn total_captured(&self) -> u64 {
        self.stats.captures_written.load(Ordering::Relaxed)
    }

    /// Get total requests whose capture was skipped by the matched rule.
    pub fn total_skipped(&self) -> u64 {
        self.stats.captures_skipped.load(Ordering::Relaxed)
    }

    /// Get total captures that failed to read or write.
    pub fn total_capture_failures(&self) -> u64 {
        self.stats.capture_failures.load(Ordering::Relaxed)
    }
}
