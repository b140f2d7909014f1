use std::any::Any;
use std::fmt;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use captains_log::recipe;
use log::Level;
use serde_derive::{Deserialize, Serialize};

use kestrel_rpc::buffer::ByteBuf;
use kestrel_rpc::codec::{CodecMessage, CodecSchema, MsgpCodec};
use kestrel_rpc::{
    provide_service, stop_pipe, ClientConfig, Message, MessageSchema, MethodDescriptor,
    ReplySink, RpcClient, RpcError, RpcServer, ServerConfig, Service, ServiceDescriptor,
};

fn setup_log() {
    let _ = recipe::raw_file_logger("/tmp", Level::Trace).test().build();
}

/// Byte-transparent message: packs as its raw payload, so wire-level
/// lengths equal payload lengths.
struct RawMessage(Vec<u8>);

impl Message for RawMessage {
    fn packed_size(&self) -> usize {
        self.0.len()
    }

    fn pack(&self, out: &mut ByteBuf) -> usize {
        out.append(&self.0);
        self.0.len()
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

struct RawSchema;

impl MessageSchema for RawSchema {
    fn unpack(&self, payload: &[u8]) -> Result<Box<dyn Message>, ()> {
        Ok(Box::new(RawMessage(payload.to_vec())))
    }
}

fn raw_descriptor() -> ServiceDescriptor {
    ServiceDescriptor {
        methods: vec![MethodDescriptor { input: Box::new(RawSchema), output: Box::new(RawSchema) }],
    }
}

struct EchoService {
    descriptor: ServiceDescriptor,
}

impl EchoService {
    fn new() -> Self {
        Self { descriptor: raw_descriptor() }
    }
}

impl Service for EchoService {
    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    fn invoke(&self, _method_index: u32, input: Box<dyn Message>, reply: ReplySink<'_>) {
        let msg = input.into_any().downcast::<RawMessage>().expect("raw message");
        reply.respond(Some(&*msg));
    }
}

struct ServerGuard {
    stop_w: OwnedFd,
    handle: thread::JoinHandle<Result<(), RpcError>>,
}

impl ServerGuard {
    /// Fire the stop source and wait for the server to tear down.
    fn stop(self) -> Duration {
        let start = Instant::now();
        nix::unistd::write(self.stop_w.as_fd(), &[1u8]).expect("stop byte");
        self.handle.join().expect("server thread").expect("server result");
        start.elapsed()
    }
}

fn start_server(url: &str, num_workers: usize, service: Arc<dyn Service>) -> ServerGuard {
    setup_log();
    let (stop_r, stop_w) = stop_pipe().expect("stop pipe");
    let url_owned = url.to_string();
    let handle = thread::spawn(move || {
        let config = ServerConfig { num_workers, ..Default::default() };
        provide_service(&url_owned, service, config, Some(stop_r))
    });
    wait_ready(url);
    ServerGuard { stop_w, handle }
}

fn wait_ready(url: &str) {
    for _ in 0..250 {
        let up = if let Some(path) = url.strip_prefix("unix://") {
            UnixStream::connect(path).is_ok()
        } else if let Some(addr) = url.strip_prefix("tcp://") {
            TcpStream::connect(addr).is_ok()
        } else {
            false
        };
        if up {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("server did not come up on {}", url);
}

fn frame(method_index: u32, request_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + payload.len());
    buf.extend_from_slice(&method_index.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&request_id.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

#[test]
fn unix_echo_wire_format() {
    let path = format!("/tmp/kestrel_echo_{}.sock", std::process::id());
    let url = format!("unix://{}", path);
    let guard = start_server(&url, 2, Arc::new(EchoService::new()));

    let mut sock = UnixStream::connect(&path).expect("connect");
    sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let payload = [7u8; 32];
    sock.write_all(&frame(0, 1, &payload)).unwrap();

    let mut resp = [0u8; 4 + 12 + 32];
    sock.read_exact(&mut resp).expect("response");
    assert_eq!(&resp[..4], &[0u8; 4]);
    assert_eq!(u32::from_le_bytes(resp[4..8].try_into().unwrap()), 0); // method_index
    assert_eq!(u32::from_le_bytes(resp[8..12].try_into().unwrap()), 32); // message_length
    assert_eq!(u32::from_le_bytes(resp[12..16].try_into().unwrap()), 1); // request_id
    assert_eq!(&resp[16..], &payload);

    guard.stop();
}

#[test]
fn tcp_two_clients_ordered() {
    let url = "tcp://127.0.0.1:45001";
    let guard = start_server(url, 4, Arc::new(EchoService::new()));

    let mut handles = Vec::new();
    for c in 0..2u32 {
        handles.push(thread::spawn(move || {
            let client = RpcClient::connect(url, raw_descriptor(), ClientConfig::default())
                .expect("connect");
            for i in 1..=100u32 {
                let body = format!("c{}-{}", c, i).into_bytes();
                let expect = body.clone();
                let mut got = None;
                client.invoke(0, &RawMessage(body), |reply| got = reply);
                let reply = got.expect("reply");
                let raw = reply.into_any().downcast::<RawMessage>().expect("raw message");
                assert_eq!(raw.0, expect);
            }
        }));
    }
    for h in handles {
        h.join().expect("client thread");
    }

    guard.stop();
}

#[test]
fn bad_method_closes_only_that_connection() {
    let path = format!("/tmp/kestrel_badm_{}.sock", std::process::id());
    let url = format!("unix://{}", path);
    let guard = start_server(&url, 2, Arc::new(EchoService::new()));

    let mut bad = UnixStream::connect(&path).expect("connect");
    bad.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    // method_index == n_methods is out of range
    bad.write_all(&frame(1, 1, b"zz")).unwrap();
    let mut buf = [0u8; 16];
    let n = bad.read(&mut buf).expect("read after bad method");
    assert_eq!(n, 0, "server should close the offending connection");

    // other connections stay serviceable
    let mut good = UnixStream::connect(&path).expect("connect");
    good.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    good.write_all(&frame(0, 2, b"still here")).unwrap();
    let mut resp = [0u8; 4 + 12 + 10];
    good.read_exact(&mut resp).expect("response");
    assert_eq!(&resp[16..], b"still here");

    guard.stop();
}

#[test]
fn partial_frame_dispatches_once() {
    let url = "tcp://127.0.0.1:45004";
    // single-threaded mode: handlers run inline on the loop thread
    let guard = start_server(url, 0, Arc::new(EchoService::new()));

    let mut sock = TcpStream::connect("127.0.0.1:45004").expect("connect");
    sock.set_nodelay(true).unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let payload = b"split-me-in-three";
    let req = frame(0, 3, payload);
    sock.write_all(&req[..5]).unwrap();
    thread::sleep(Duration::from_millis(50));
    sock.write_all(&req[5..9]).unwrap();
    thread::sleep(Duration::from_millis(50));
    sock.write_all(&req[9..]).unwrap();

    let mut resp = vec![0u8; 4 + 12 + payload.len()];
    sock.read_exact(&mut resp).expect("response");
    assert_eq!(u32::from_le_bytes(resp[8..12].try_into().unwrap()), payload.len() as u32);
    assert_eq!(u32::from_le_bytes(resp[12..16].try_into().unwrap()), 3);
    assert_eq!(&resp[16..], payload);

    // exactly one dispatch: nothing further arrives
    sock.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    let mut extra = [0u8; 1];
    assert!(sock.read(&mut extra).is_err(), "unexpected extra response bytes");

    guard.stop();
}

#[test]
fn stop_source_shuts_down_quickly() {
    let path = format!("/tmp/kestrel_stop_{}.sock", std::process::id());
    let url = format!("unix://{}", path);
    let guard = start_server(&url, 2, Arc::new(EchoService::new()));
    assert!(Path::new(&path).exists());

    let elapsed = guard.stop();
    assert!(elapsed < Duration::from_millis(100), "shutdown took {:?}", elapsed);
    assert!(!Path::new(&path).exists(), "unix path should be unlinked");
    assert!(UnixStream::connect(&path).is_err(), "listener should be closed");
}

#[test]
fn client_times_out_on_mute_server() {
    setup_log();
    let listener = TcpListener::bind("127.0.0.1:45006").expect("bind");
    let mute = thread::spawn(move || {
        // accept and hold the connection without ever replying
        let (stream, _) = listener.accept().expect("accept");
        thread::sleep(Duration::from_secs(2));
        drop(stream);
    });

    let config = ClientConfig { rpc_timeout: Duration::from_millis(200) };
    let client =
        RpcClient::connect("tcp://127.0.0.1:45006", raw_descriptor(), config).expect("connect");
    let start = Instant::now();
    let mut got: Option<Option<Box<dyn Message>>> = None;
    client.invoke(0, &RawMessage(b"anyone home".to_vec()), |reply| got = Some(reply));
    let elapsed = start.elapsed();

    let reply = got.expect("closure must run exactly once");
    assert!(reply.is_none(), "timeout must surface as a None reply");
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(2));

    mute.join().unwrap();
}

#[test]
fn bind_unbind_lifecycle() {
    setup_log();
    let pid = std::process::id();
    let path_a = format!("/tmp/kestrel_bind_a_{}.sock", pid);
    let path_b = format!("/tmp/kestrel_bind_b_{}.sock", pid);

    let mut server =
        RpcServer::new(Arc::new(EchoService::new()), ServerConfig::default()).expect("server");
    server.bind_url(&format!("unix://{}", path_a)).expect("bind a");
    server.bind_url(&format!("unix://{}", path_b)).expect("bind b");
    server.bind_url("tcp://127.0.0.1:45003").expect("bind tcp");
    assert!(Path::new(&path_a).exists());
    assert!(Path::new(&path_b).exists());

    assert!(server.unbind_url(&format!("unix://{}", path_a)));
    assert!(!Path::new(&path_a).exists());
    assert!(!server.unbind_url(&format!("unix://{}", path_a)), "second unbind finds nothing");
    assert!(Path::new(&path_b).exists(), "other endpoints untouched");

    assert!(server.unbind_url("tcp://127.0.0.1:45003"));
    assert!(!server.unbind_url("tcp://127.0.0.1:45003"));
    assert!(server.unbind_url(&format!("unix://{}", path_b)));
    assert!(!Path::new(&path_b).exists());
}

// -- msgpack service over the codec bridge ---------------------------------

#[derive(Default, Serialize, Deserialize, PartialEq, Debug)]
struct AddReq {
    pub a: i64,
    pub b: i64,
}

impl fmt::Display for AddReq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "a={} b={}", self.a, self.b)
    }
}

#[derive(Default, Serialize, Deserialize, PartialEq, Debug)]
struct AddResp {
    pub sum: i64,
}

impl fmt::Display for AddResp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "sum={}", self.sum)
    }
}

fn adder_descriptor() -> ServiceDescriptor {
    ServiceDescriptor {
        methods: vec![MethodDescriptor {
            input: Box::new(CodecSchema::<AddReq, MsgpCodec>::new()),
            output: Box::new(CodecSchema::<AddResp, MsgpCodec>::new()),
        }],
    }
}

struct AdderService {
    descriptor: ServiceDescriptor,
}

impl Service for AdderService {
    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    fn invoke(&self, _method_index: u32, input: Box<dyn Message>, reply: ReplySink<'_>) {
        let req = input.into_any().downcast::<CodecMessage<AddReq>>().expect("add request");
        let resp = CodecMessage::new(
            &MsgpCodec::default(),
            AddResp { sum: req.value.a + req.value.b },
        )
        .expect("encode response");
        reply.respond(Some(&resp));
    }
}

#[test]
fn msgpack_service_roundtrip() {
    let path = format!("/tmp/kestrel_add_{}.sock", std::process::id());
    let url = format!("unix://{}", path);
    let service = Arc::new(AdderService { descriptor: adder_descriptor() });
    let guard = start_server(&url, 2, service);

    let client =
        RpcClient::connect(&url, adder_descriptor(), ClientConfig::default()).expect("connect");
    let codec = MsgpCodec::default();
    for (a, b) in [(1i64, 2i64), (-5, 5), (1 << 40, 1)] {
        let req = CodecMessage::new(&codec, AddReq { a, b }).expect("encode");
        let mut got = None;
        client.invoke(0, &req, |reply| got = reply);
        let reply = got.expect("reply");
        let resp = reply.into_any().downcast::<CodecMessage<AddResp>>().expect("add response");
        assert_eq!(resp.value.sum, a + b);
    }

    guard.stop();
}
