//! End-to-end coverage of the 24-byte-header binary protocol over a real
//! TCP socket.

use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use tinymemd::cache::Cache;

const OP_GET: u8 = 0x00;
const OP_SET: u8 = 0x01;
const OP_GETK: u8 = 0x0C;

async fn spawn_server(shards: usize, max_bytes: usize) -> SocketAddr {
    let cache = Arc::new(Cache::new(shards, max_bytes, Arc::new(AtomicUsize::new(0))));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let cache = cache.clone();
            tokio::spawn(async move {
                let _ = stream.set_nodelay(true);
                tinymemd::server::connection::handle(stream, cache).await;
            });
        }
    });
    addr
}

/// Builds one request frame: 24-byte header + extras + key + value.
fn build_request(opcode: u8, opaque: u32, cas: u64, extras: &[u8], key: &[u8], value: &[u8]) -> Vec<u8> {
    let body_len = extras.len() + key.len() + value.len();
    let mut frame = Vec::with_capacity(24 + body_len);
    frame.push(0x80); // magic
    frame.push(opcode);
    frame.extend_from_slice(&(key.len() as u16).to_be_bytes());
    frame.push(extras.len() as u8);
    frame.push(0); // data type
    frame.extend_from_slice(&[0, 0]); // reserved
    frame.extend_from_slice(&(body_len as u32).to_be_bytes());
    frame.extend_from_slice(&opaque.to_be_bytes());
    frame.extend_from_slice(&cas.to_be_bytes());
    frame.extend_from_slice(extras);
    frame.extend_from_slice(key);
    frame.extend_from_slice(value);
    frame
}

struct Response {
    opcode: u8,
    status: u16,
    opaque: u32,
    cas: u64,
    extras: Vec<u8>,
    key: Vec<u8>,
    value: Vec<u8>,
}

async fn read_response(stream: &mut TcpStream) -> Response {
    let mut header = [0u8; 24];
    stream.read_exact(&mut header).await.expect("read header");
    assert_eq!(header[0], 0x81, "response magic");
    let opcode = header[1];
    let key_len = u16::from_be_bytes([header[2], header[3]]) as usize;
    let extras_len = header[4] as usize;
    let status = u16::from_be_bytes([header[6], header[7]]);
    let body_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
    let opaque = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);
    let cas = u64::from_be_bytes(header[16..24].try_into().unwrap());
    let mut body = vec![0u8; body_len];
    stream.read_exact(&mut body).await.expect("read body");
    let extras = body[..extras_len].to_vec();
    let key = body[extras_len..extras_len + key_len].to_vec();
    let value = body[extras_len + key_len..].to_vec();
    Response { opcode, status, opaque, cas, extras, key, value }
}

#[tokio::test]
async fn set_then_get_round_trips_over_binary() {
    let addr = spawn_server(1, 0).await;
    let mut stream = TcpStream::connect(addr).await.expect("connect");

    let mut extras = [0u8; 8]; // flags=0, expiration=0
    extras[3] = 7; // flags = 7
    let req = build_request(OP_SET, 1, 0, &extras, b"foo", b"hello");
    stream.write_all(&req).await.unwrap();
    let resp = read_response(&mut stream).await;
    assert_eq!(resp.status, 0x0000);
    assert_eq!(resp.opaque, 1);

    let req = build_request(OP_GET, 2, 0, &[], b"foo", &[]);
    stream.write_all(&req).await.unwrap();
    let resp = read_response(&mut stream).await;
    assert_eq!(resp.status, 0x0000);
    assert_eq!(resp.value, b"hello");
    assert_eq!(&resp.extras[..], &[0, 0, 0, 7]);
}

#[tokio::test]
async fn s6_binary_getk_miss() {
    let addr = spawn_server(1, 0).await;
    let mut stream = TcpStream::connect(addr).await.expect("connect");

    let req = build_request(OP_GETK, 42, 0, &[], b"missing", &[]);
    stream.write_all(&req).await.unwrap();
    let resp = read_response(&mut stream).await;

    assert_eq!(resp.status, 0x0001);
    assert_eq!(resp.value, b"Not found");
    assert_eq!(resp.opaque, 42);
    assert_eq!(resp.cas, 0);
    assert_eq!(resp.opcode, OP_GETK);
}

#[tokio::test]
async fn quiet_opcode_suppresses_success_but_not_errors() {
    const OP_ADDQ: u8 = 0x12;
    const OP_GETQ: u8 = 0x09;
    const OP_NOOP: u8 = 0x0A;

    let addr = spawn_server(1, 0).await;
    let mut stream = TcpStream::connect(addr).await.expect("connect");

    let extras = [0u8; 8];
    let add_req = build_request(OP_ADDQ, 10, 0, &extras, b"q", b"v");
    // A no-op afterwards gives us something to read back, proving AddQ's
    // own success response was suppressed.
    let noop_req = build_request(OP_NOOP, 11, 0, &[], &[], &[]);
    stream.write_all(&add_req).await.unwrap();
    stream.write_all(&noop_req).await.unwrap();

    let resp = read_response(&mut stream).await;
    assert_eq!(resp.opcode, OP_NOOP);
    assert_eq!(resp.opaque, 11);

    // A second AddQ on the same key fails and must still produce a
    // response, quiet or not.
    let add_again = build_request(OP_ADDQ, 12, 0, &extras, b"q", b"v2");
    stream.write_all(&add_again).await.unwrap();
    let resp = read_response(&mut stream).await;
    assert_eq!(resp.status, 0x0002); // KeyExists
    assert_eq!(resp.opaque, 12);

    let get_req = build_request(OP_GETQ, 13, 0, &[], b"q", &[]);
    let noop_req2 = build_request(OP_NOOP, 14, 0, &[], &[], &[]);
    stream.write_all(&get_req).await.unwrap();
    stream.write_all(&noop_req2).await.unwrap();
    let resp = read_response(&mut stream).await;
    assert_eq!(resp.opcode, OP_NOOP);
    assert_eq!(resp.opaque, 14);
}

#[tokio::test]
async fn increment_creates_with_initial_value() {
    const OP_INCREMENT: u8 = 0x05;

    let addr = spawn_server(1, 0).await;
    let mut stream = TcpStream::connect(addr).await.expect("connect");

    let mut extras = [0u8; 20];
    extras[0..8].copy_from_slice(&5u64.to_be_bytes()); // delta
    extras[8..16].copy_from_slice(&100u64.to_be_bytes()); // initial
    extras[16..20].copy_from_slice(&0u32.to_be_bytes()); // expiration

    let req = build_request(OP_INCREMENT, 1, 0, &extras, b"counter", &[]);
    stream.write_all(&req).await.unwrap();
    let resp = read_response(&mut stream).await;
    assert_eq!(resp.status, 0x0000);
    assert_eq!(u64::from_be_bytes(resp.value.try_into().unwrap()), 100);

    let req = build_request(OP_INCREMENT, 2, 0, &extras, b"counter", &[]);
    stream.write_all(&req).await.unwrap();
    let resp = read_response(&mut stream).await;
    assert_eq!(u64::from_be_bytes(resp.value.try_into().unwrap()), 105);
}
