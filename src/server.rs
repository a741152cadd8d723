//! HTTP listener.
//!
//! Accepts connections and serves each one on its own task with hyper's
//! HTTP/1 connection driver. Every request goes through
//! [`Engine::spawn_handle`].

use crate::config::ServerConfig;
use crate::engine::Engine;
use anyhow::Context;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Bound server, ready to run.
pub struct Server {
    listener: TcpListener,
    engine: Arc<Engine>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl Server {
    /// Build the engine and bind the listening socket. Failing to bind is
    /// the only fatal startup error.
    pub async fn bind(config: &ServerConfig) -> anyhow::Result<Self> {
        let address = config.bind_address();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("unable to bind {}", address))?;

        Ok(Self {
            listener,
            engine: Arc::new(Engine::new(config)),
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Serve until `shutdown` resolves, then let open connections finish
    /// their in-flight requests, wait for pending capture writes and return.
    pub async fn run<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(address = %self.local_addr()?, "Server started");

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        let mut shutdown = std::pin::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!(error = %e, "Accept error");
                            continue;
                        }
                    };
                    connections.spawn(serve_connection(
                        stream,
                        remote,
                        Arc::clone(&self.engine),
                        self.read_timeout,
                        self.write_timeout,
                        stop_rx.clone(),
                    ));
                }
                _ = &mut shutdown => {
                    info!("Stopping the server...");
                    break;
                }
            }
        }

        drop(self.listener);
        let _ = stop_tx.send(true);
        while connections.join_next().await.is_some() {}
        self.engine.wait_for_captures().await;

        info!(
            requests = self.engine.total_requests(),
            captured = self.engine.total_captured(),
            skipped = self.engine.total_skipped(),
            capture_failures = self.engine.total_capture_failures(),
            "Server stopped."
        );
        Ok(())
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    remote: SocketAddr,
    engine: Arc<Engine>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    mut stop: watch::Receiver<bool>,
) {
    let service = service_fn(move |req| {
        // Runs apart from the connection, so a client leaving early cannot
        // cancel the capture.
        let reply = engine.spawn_handle(req, Some(remote));
        await_reply(reply, write_timeout)
    });

    let mut builder = http1::Builder::new();
    builder.timer(TokioTimer::new());
    if let Some(limit) = read_timeout {
        builder.header_read_timeout(limit);
    }

    let connection = builder.serve_connection(TokioIo::new(stream), service);
    let mut connection = std::pin::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = stop.changed() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };

    match result {
        Ok(()) => debug!(%remote, "Connection closed"),
        Err(e) => error!(%remote, error = %e, "Unable to send the response"),
    }
}

async fn await_reply(
    reply: tokio::sync::oneshot::Receiver<hyper::Response<http_body_util::Full<bytes::Bytes>>>,
    write_timeout: Option<Duration>,
) -> Result<hyper::Response<http_body_util::Full<bytes::Bytes>>, BoxError> {
    let reply = match write_timeout {
        Some(limit) => tokio::time::timeout(limit, reply).await?,
        None => reply.await,
    };
    Ok(reply?)
}
