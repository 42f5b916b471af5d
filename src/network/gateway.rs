//! Listener gateway: accepts client connections, applies the per-IP
//! connection bucket, and spawns a connection task per accept.

use super::connection;
use crate::handlers::Registry;
use crate::state::Fabric;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub struct Gateway {
    listeners: Vec<(TcpListener, bool)>,
}

impl Gateway {
    /// Bind every configured client listener.
    pub async fn bind(fabric: &Arc<Fabric>) -> std::io::Result<Self> {
        let config = fabric.config();
        let mut listeners = Vec::new();
        for listener_cfg in &config.listeners {
            let addr = listener_cfg
                .socket_addr()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
            let listener = TcpListener::bind(addr).await?;
            info!(addr = %addr, tls = listener_cfg.tls, "Client listener bound");
            listeners.push((listener, listener_cfg.tls));
        }
        Ok(Self { listeners })
    }

    /// Run all accept loops until shutdown.
    pub async fn run(self, fabric: Arc<Fabric>, registry: Arc<Registry>) {
        let mut tasks = Vec::new();
        for (listener, secure) in self.listeners {
            let fabric = fabric.clone();
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                accept_loop(listener, secure, fabric, registry).await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    secure: bool,
    fabric: Arc<Fabric>,
    registry: Arc<Registry>,
) {
    let mut shutdown_rx = fabric.shutdown.subscribe();
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown_rx.recv() => {
                info!("Listener shutting down");
                return;
            }
        };
        let (mut stream, addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                continue;
            }
        };

        // Per-source-IP token bucket: refuse with a best-effort ERROR line
        // when the bucket is dry.
        if !fabric.rate_limiter.admit_connection(addr.ip()) {
            let _ = stream
                .write_all(b"ERROR :Connection rate exceeded, try again later\r\n")
                .await;
            continue;
        }

        let fabric = fabric.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            connection::run(fabric, registry, stream, addr, secure).await;
        });
    }
}
