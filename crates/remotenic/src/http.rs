//! HTTP clients whose connections are dialed through an entrance stack.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};

use hyper::client::connect::{Connected, Connection};
use hyper::{Client, Uri};
use remotenic_stack::{Stack, TcpStream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

/// Connector that dials `host:port` through the stack.
///
/// Hosts must be IP literals; the stack has no resolver.
#[derive(Clone)]
pub struct StackConnector {
    stack: Stack,
}

impl StackConnector {
    pub fn new(stack: Stack) -> Self {
        Self { stack }
    }
}

impl tower_service::Service<Uri> for StackConnector {
    type Response = StackConnection;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = io::Result<StackConnection>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let stack = self.stack.clone();
        Box::pin(async move {
            let addr = target_addr(&uri)?;
            debug!(%uri, %addr, "dialing through stack");
            let stream = stack.dial_tcp(addr).await.map_err(io::Error::from)?;
            Ok(StackConnection { stream })
        })
    }
}

fn target_addr(uri: &Uri) -> io::Result<SocketAddr> {
    let host = uri
        .host()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "uri has no host"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let ip: IpAddr = host.parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "host must be an ip literal, the stack has no resolver",
        )
    })?;
    let port = uri.port_u16().unwrap_or_else(|| {
        if uri.scheme_str() == Some("https") {
            443
        } else {
            80
        }
    });
    Ok(SocketAddr::new(ip, port))
}

/// A stack-dialed connection usable by the hyper client.
pub struct StackConnection {
    stream: TcpStream,
}

impl Connection for StackConnection {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl AsyncRead for StackConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for StackConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// A plain-HTTP client that dials through the given stack.
pub fn client(stack: Stack) -> Client<StackConnector> {
    Client::builder().build(StackConnector::new(stack))
}

/// A client speaking HTTP and HTTPS through the stack. `tls` replaces the
/// default TLS configuration (native roots) when given.
pub fn https_client(
    stack: Stack,
    tls: Option<rustls::ClientConfig>,
) -> Client<hyper_rustls::HttpsConnector<StackConnector>> {
    let connector = StackConnector::new(stack);
    let https = match tls {
        Some(config) => hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(connector),
        None => hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .https_or_http()
            .enable_http1()
            .wrap_connector(connector),
    };
    Client::builder().build(https)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_addr_parses_ip_hosts_and_default_ports() {
        let addr = target_addr(&"http://192.168.1.134/".parse().unwrap()).unwrap();
        assert_eq!(addr, "192.168.1.134:80".parse().unwrap());

        let addr = target_addr(&"https://192.168.1.134/x".parse().unwrap()).unwrap();
        assert_eq!(addr, "192.168.1.134:443".parse().unwrap());

        let addr = target_addr(&"http://[fd00::1]:8080/".parse().unwrap()).unwrap();
        assert_eq!(addr, "[fd00::1]:8080".parse().unwrap());
    }

    #[test]
    fn target_addr_rejects_hostnames() {
        let err = target_addr(&"http://example.com/".parse().unwrap()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
