//! The HTTP-serving TCP handler: flows terminate at an in-process origin
//! instead of being dialed onto the host network.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use hyper::{Body, Response};
use remotenic::forward::HttpTcpForwarder;
use remotenic::stack::{Cidr, Route, Stack, StackConfig};
use tokio::time::timeout;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flows_are_served_by_the_local_http_handler() {
    let (client_stack, client_chan) = Stack::new(StackConfig {
        address: "10.0.0.1".parse().unwrap(),
        ..StackConfig::default()
    })
    .unwrap();
    client_stack.set_route_table(vec![Route {
        dest: "0.0.0.0/0".parse::<Cidr>().unwrap(),
        gateway: client_stack.addr(),
        nic: client_stack.nic(),
    }]);

    let (server_stack, server_chan) = Stack::new(StackConfig {
        address: "192.168.1.1".parse().unwrap(),
        ..StackConfig::default()
    })
    .unwrap();
    server_stack.set_route_table(vec![Route {
        dest: "10.0.0.1/32".parse::<Cidr>().unwrap(),
        gateway: server_stack.addr(),
        nic: server_stack.nic(),
    }]);
    server_stack.set_promiscuous_mode(true);
    server_stack.set_tcp_forward_handler(Arc::new(HttpTcpForwarder::new(|_req| async {
        Ok::<_, Infallible>(Response::new(Body::from("served in userspace")))
    })));

    tokio::spawn(remotenic::join(client_chan, server_chan));

    let client = remotenic::http::client(client_stack.clone());
    let response = timeout(
        Duration::from_secs(10),
        client.get("http://192.168.77.1:8080/".parse().unwrap()),
    )
    .await
    .expect("request timed out")
    .expect("request failed");
    assert_eq!(response.status(), 200);
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(&body[..], b"served in userspace");

    client_stack.close();
    server_stack.close();
}
