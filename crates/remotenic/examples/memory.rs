//! Loopback demo: an HTTP request through an entrance/exit pair joined by
//! an in-memory link. The exit forwards the flow onto the host loopback,
//! where a small origin server answers.

use std::convert::Infallible;

use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Response};
use remotenic::{carrier, Mode, Vni, VniConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // The origin this request will ultimately reach.
    let make = make_service_fn(|_| async {
        Ok::<_, Infallible>(service_fn(|_req| async {
            Ok::<_, Infallible>(Response::new(Body::from("hello from the exit side\n")))
        }))
    });
    let server = hyper::Server::bind(&"127.0.0.1:0".parse()?).serve(make);
    let origin = server.local_addr();
    tokio::spawn(server);

    // Two interfaces joined by an in-memory byte pipe.
    let (near, far) = carrier::memory_link();
    let entrance = Vni::new(VniConfig::new(Mode::Entrance, near))?;
    let exit = Vni::new(VniConfig::new(Mode::Exit, far))?;

    // Dial the origin through the tunnel.
    let client = remotenic::http::client(entrance.stack());
    let response = client.get(format!("http://{origin}/").parse()?).await?;
    println!("status: {}", response.status());
    let body = hyper::body::to_bytes(response.into_body()).await?;
    print!("{}", String::from_utf8_lossy(&body));

    entrance.stop();
    exit.stop();
    Ok(())
}
