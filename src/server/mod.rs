//! Connection acceptor: binds TCP or Unix-domain, enforces the connection
//! cap, and spawns one task per accepted connection.

pub mod connection;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, UnixListener};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cache::Cache;

pub enum Bind {
    Tcp { host: String, port: u16 },
    Unix { path: String },
}

/// Runs the accept loop until `shutdown` reports `true`. Returns once the
/// listener has been closed and no new connections will be accepted;
/// in-flight connections are left to drain on their own. `active` is the
/// same connection counter the cache reports in `stats`.
pub async fn run(
    bind: Bind,
    cache: Arc<Cache>,
    max_connections: usize,
    active: Arc<AtomicUsize>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    match bind {
        Bind::Tcp { host, port } => {
            let addr = format!("{host}:{port}");
            let listener = TcpListener::bind(&addr).await?;
            info!(%addr, "listening on TCP");
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("shutdown requested, closing TCP listener");
                        return Ok(());
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let _ = stream.set_nodelay(true);
                                accept_one(stream, peer.to_string(), cache.clone(), active.clone(), max_connections);
                            }
                            Err(e) => warn!(error = %e, "accept failed"),
                        }
                    }
                }
            }
        }
        Bind::Unix { path } => {
            if Path::new(&path).exists() {
                std::fs::remove_file(&path)?;
            }
            let listener = UnixListener::bind(&path)?;
            info!(%path, "listening on Unix socket");
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("shutdown requested, closing Unix listener");
                        return Ok(());
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _addr)) => {
                                accept_one(stream, path.clone(), cache.clone(), active.clone(), max_connections);
                            }
                            Err(e) => warn!(error = %e, "accept failed"),
                        }
                    }
                }
            }
        }
    }
}

fn accept_one<S>(stream: S, peer: String, cache: Arc<Cache>, active: Arc<AtomicUsize>, max_connections: usize)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    if active.load(Ordering::Relaxed) >= max_connections {
        // Over the cap: close immediately without a protocol handshake.
        drop(stream);
        warn!(%peer, "connection cap reached, rejecting");
        return;
    }
    active.fetch_add(1, Ordering::Relaxed);
    tokio::spawn(async move {
        connection::handle(stream, cache).await;
        active.fetch_sub(1, Ordering::Relaxed);
    });
}
