//! A TCP forward handler that serves HTTP locally instead of dialing out.
//!
//! Useful when the exit side wants to answer flows itself, and as an
//! in-process origin in tests.

use std::convert::Infallible;
use std::future::Future;

use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Request, Response};
use remotenic_stack::{TcpForwardHandler, TcpForwardRequest};
use tracing::debug;

/// Serves every accepted flow with `handler` over HTTP/1.
pub struct HttpTcpForwarder<F> {
    handler: F,
}

impl<F, Fut> HttpTcpForwarder<F>
where
    F: Fn(Request<Body>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<Body>, Infallible>> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F, Fut> TcpForwardHandler for HttpTcpForwarder<F>
where
    F: Fn(Request<Body>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<Body>, Infallible>> + Send + 'static,
{
    fn handle(&self, mut request: TcpForwardRequest) {
        let handler = self.handler.clone();
        tokio::spawn(async move {
            let flow = request.id();
            let stream = match request.create_endpoint() {
                Ok(stream) => stream,
                Err(err) => {
                    debug!(%flow, %err, "creating endpoint failed");
                    request.complete(true);
                    return;
                }
            };
            request.complete(false);
            debug!(%flow, "serving http over tcp flow");
            let service = service_fn(move |req| (handler.clone())(req));
            if let Err(err) = Http::new().serve_connection(stream, service).await {
                debug!(%flow, %err, "http flow ended with error");
            }
        });
    }
}
