//! The same loopback demo, but with the two interfaces joined by a real
//! TCP connection instead of an in-memory pipe. In a real deployment the
//! two ends live on different machines and the carrier is whatever byte
//! stream connects them.

use std::convert::Infallible;
use std::net::SocketAddr;

use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Response};
use remotenic::{Mode, Vni, VniConfig};
use tokio::net::{TcpListener, TcpStream};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let tunnel_addr: SocketAddr = std::env::var("REMOTENIC_TUNNEL_ADDR")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| "127.0.0.1:4555".parse().expect("static addr"));

    let make = make_service_fn(|_| async {
        Ok::<_, Infallible>(service_fn(|_req| async {
            Ok::<_, Infallible>(Response::new(Body::from("hello over the tcp carrier\n")))
        }))
    });
    let server = hyper::Server::bind(&"127.0.0.1:0".parse()?).serve(make);
    let origin = server.local_addr();
    tokio::spawn(server);

    // Carrier: one TCP connection, one end per interface.
    let listener = TcpListener::bind(tunnel_addr).await?;
    let (accepted, connected) = tokio::join!(listener.accept(), TcpStream::connect(tunnel_addr));
    let (exit_carrier, _) = accepted?;
    let entrance_carrier = connected?;
    exit_carrier.set_nodelay(true)?;
    entrance_carrier.set_nodelay(true)?;

    let entrance = Vni::new(VniConfig::new(Mode::Entrance, entrance_carrier))?;
    let exit = Vni::new(VniConfig::new(Mode::Exit, exit_carrier))?;

    let client = remotenic::http::client(entrance.stack());
    let response = client.get(format!("http://{origin}/").parse()?).await?;
    println!("status: {}", response.status());
    let body = hyper::body::to_bytes(response.into_body()).await?;
    print!("{}", String::from_utf8_lossy(&body));

    entrance.stop();
    exit.stop();
    Ok(())
}
