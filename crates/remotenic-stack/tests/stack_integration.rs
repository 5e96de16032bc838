//! Two stacks joined back-to-back through their packet channels, one
//! dialing out, the other terminating flows with forward handlers.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use remotenic_stack::{
    Cidr, PacketChannel, Route, Stack, StackConfig, TcpForwardHandler, TcpForwardRequest,
    UdpForwardHandler, UdpForwardRequest,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

const CLIENT_ADDR: &str = "10.0.0.1";
const SERVER_ADDR: &str = "192.168.1.1";

fn self_route(stack: &Stack, dest: Cidr) -> Route {
    Route {
        dest,
        gateway: stack.addr(),
        nic: stack.nic(),
    }
}

/// Pumps frames between two packet channels in both directions.
fn link(a: PacketChannel, b: PacketChannel) {
    let (mut ar, mut aw) = tokio::io::split(a);
    let (mut br, mut bw) = tokio::io::split(b);
    tokio::spawn(async move {
        let _ = tokio::io::copy(&mut ar, &mut bw).await;
    });
    tokio::spawn(async move {
        let _ = tokio::io::copy(&mut br, &mut aw).await;
    });
}

fn client_stack() -> (Stack, PacketChannel) {
    let (stack, chan) = Stack::new(StackConfig {
        address: CLIENT_ADDR.parse().unwrap(),
        ..StackConfig::default()
    })
    .unwrap();
    stack.set_route_table(vec![self_route(&stack, "0.0.0.0/0".parse().unwrap())]);
    (stack, chan)
}

fn server_stack(expose: &[&str]) -> (Stack, PacketChannel) {
    let (stack, chan) = Stack::new(StackConfig {
        address: SERVER_ADDR.parse().unwrap(),
        ..StackConfig::default()
    })
    .unwrap();
    let routes = expose
        .iter()
        .map(|cidr| self_route(&stack, cidr.parse().unwrap()))
        .collect();
    stack.set_route_table(routes);
    stack.set_promiscuous_mode(true);
    (stack, chan)
}

struct EchoTcp;

impl TcpForwardHandler for EchoTcp {
    fn handle(&self, mut request: TcpForwardRequest) {
        tokio::spawn(async move {
            let stream = match request.create_endpoint() {
                Ok(stream) => stream,
                Err(_) => {
                    request.complete(true);
                    return;
                }
            };
            request.complete(false);
            let (mut reader, mut writer) = tokio::io::split(stream);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });
    }
}

struct EchoUdp;

impl UdpForwardHandler for EchoUdp {
    fn handle(&self, mut request: UdpForwardRequest) {
        tokio::spawn(async move {
            let Ok(endpoint) = request.create_endpoint() else {
                return;
            };
            let mut buf = vec![0u8; 2048];
            while let Ok(n) = endpoint.recv(&mut buf).await {
                if endpoint.send(&buf[..n]).await.is_err() {
                    break;
                }
            }
        });
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tcp_flow_reaches_forward_handler() {
    let (client, client_chan) = client_stack();
    let (server, server_chan) = server_stack(&[&format!("{CLIENT_ADDR}/32")]);
    link(client_chan, server_chan);
    server.set_tcp_forward_handler(Arc::new(EchoTcp));

    let target: SocketAddr = "192.168.50.9:7070".parse().unwrap();
    let mut stream = timeout(Duration::from_secs(5), client.dial_tcp(target))
        .await
        .expect("dial timed out")
        .expect("dial failed");

    stream.write_all(b"hello through the stack").await.unwrap();
    let mut buf = [0u8; 64];
    let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    assert_eq!(&buf[..n], b"hello through the stack");

    client.close();
    server.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_tcp_flows_to_same_destination() {
    let (client, client_chan) = client_stack();
    let (server, server_chan) = server_stack(&[&format!("{CLIENT_ADDR}/32")]);
    link(client_chan, server_chan);
    server.set_tcp_forward_handler(Arc::new(EchoTcp));

    let target: SocketAddr = "192.168.50.9:7070".parse().unwrap();
    let mut tasks = Vec::new();
    for i in 0..4u8 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let mut stream = client.dial_tcp(target).await.expect("dial failed");
            let message = vec![i; 512];
            stream.write_all(&message).await.unwrap();
            let mut got = vec![0u8; 512];
            stream.read_exact(&mut got).await.unwrap();
            assert_eq!(got, message);
        }));
    }
    for task in tasks {
        timeout(Duration::from_secs(10), task)
            .await
            .expect("flow timed out")
            .unwrap();
    }

    client.close();
    server.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn udp_flow_echoes_through_forward_handler() {
    let (client, client_chan) = client_stack();
    let (server, server_chan) = server_stack(&[&format!("{CLIENT_ADDR}/32")]);
    link(client_chan, server_chan);
    server.set_udp_forward_handler(Arc::new(EchoUdp));

    let socket = client.bind_udp(None).unwrap();
    let target: SocketAddr = "192.168.50.9:5353".parse().unwrap();
    socket.send_to(b"ping", target).await.unwrap();

    let mut buf = [0u8; 128];
    let (n, from) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("no reply within deadline")
        .unwrap();
    assert_eq!(&buf[..n], b"ping");
    assert_eq!(from, target);

    client.close();
    server.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flows_without_return_route_are_refused() {
    let (client, client_chan) = client_stack();
    // No exposed routes: the server cannot answer the client's address.
    let (server, server_chan) = server_stack(&[]);
    link(client_chan, server_chan);
    server.set_tcp_forward_handler(Arc::new(EchoTcp));

    let target: SocketAddr = "192.168.50.9:7070".parse().unwrap();
    let result = timeout(Duration::from_secs(5), client.dial_tcp(target))
        .await
        .expect("dial should resolve, not hang");
    assert!(result.is_err());

    client.close();
    server.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dial_without_route_fails_locally() {
    let (stack, _chan) = Stack::new(StackConfig::default()).unwrap();
    // Empty route table: nothing is dialable.
    stack.set_route_table(Vec::new());
    let err = stack
        .dial_tcp("10.1.2.3:80".parse().unwrap())
        .await
        .unwrap_err();
    let addr: IpAddr = "10.1.2.3".parse().unwrap();
    assert!(matches!(err, remotenic_stack::StackError::Unroutable(a) if a == addr));
    stack.close();
}
