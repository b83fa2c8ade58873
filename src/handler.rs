//! The request handling seam shared by the gateway layers

use crate::body::ProxyBody;
use async_trait::async_trait;
use hyper::{Request, Response};
use std::net::SocketAddr;

/// One layer of the gateway stack
///
/// Layers own the next layer and call it explicitly; a handler always produces a
/// response, rendering its own failures as error responses.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: Request<ProxyBody>) -> Response<ProxyBody>;
}

/// Peer address of the connection a request arrived on, stored in request extensions
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

#[async_trait]
impl<H: Handler + ?Sized> Handler for std::sync::Arc<H> {
    async fn handle(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        (**self).handle(req).await
    }
}
