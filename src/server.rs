//! HTTP listener shared by the gateway and the control API

use crate::handler::{ClientAddr, Handler};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// A bound listener dispatching every request to one handler
pub struct Server {
    name: &'static str,
    listener: TcpListener,
    handler: Arc<dyn Handler>,
}

impl Server {
    pub async fn bind(
        name: &'static str,
        addr: SocketAddr,
        handler: Arc<dyn Handler>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {} listener on {}: {}", name, addr, e))?;
        Ok(Self {
            name,
            listener,
            handler,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown is signalled
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!(server = self.name, addr = %addr, "Listening (HTTP/1.1 and HTTP/2)");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let handler = Arc::clone(&self.handler);
                            let name = self.name;
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer, handler).await {
                                    debug!(server = name, addr = %peer, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(server = self.name, error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(server = self.name, "Server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    handler: Arc<dyn Handler>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let handler = Arc::clone(&handler);
        async move {
            let mut req = req.map(|body| body.boxed());
            req.extensions_mut().insert(ClientAddr(peer));
            Ok::<_, Infallible>(handler.handle(req).await)
        }
    });

    // Upgrades stay enabled for the notification sockets on the control listener.
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
