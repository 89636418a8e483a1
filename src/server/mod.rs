// src/server/mod.rs

//! Client-facing TCP server.

pub mod connection;
pub mod messages;

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::errors::Result;
use crate::pipeline::Pipeline;

pub use connection::serve_connection;
pub use messages::{ClientMessage, Envelope, ServerMessage, StartRequest};

#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    pipeline: Pipeline,
}

impl Server {
    pub async fn bind(addr: &str, pipeline: Pipeline) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "listening for clients");
        Ok(Self { listener, pipeline })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested; no longer accepting clients");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!(%peer, error = %e, "failed to set TCP_NODELAY");
                        }
                        info!(%peer, "client connected");
                        let pipeline = self.pipeline.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, pipeline).await {
                                error!(%peer, error = %e, "connection failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
    }
}
