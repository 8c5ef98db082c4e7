//! Simulated devices, network and broker shared by the integration tests.

#![allow(dead_code)]

use futures_core::Stream;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tuya2mqtt::bridge::{InboundMessage, Messenger};
use tuya2mqtt::codec::FrameCodec;
use tuya2mqtt::handshake::{NONCE_LEN, derive_session_key, nonce_hmac};
use tuya2mqtt::protocol::{CommandType, Frame, Generation};
use tuya2mqtt::session::SessionOptions;
use tuya2mqtt::transport::{Connector, read_frame};

pub const KEY: &str = "0123456789abcdef";
const STEP: Duration = Duration::from_secs(2);

/// A request as seen by a simulated device.
#[derive(Debug, Clone)]
pub struct Request {
    pub seqno: u32,
    pub command: Option<CommandType>,
    pub body: Value,
}

impl Request {
    pub fn is_control(&self) -> bool {
        matches!(
            self.command,
            Some(CommandType::Control | CommandType::ControlNew)
        )
    }

    /// DPs and addressing token, for both legacy and nested bodies.
    pub fn dps_and_cid(&self) -> (Value, Option<String>) {
        let scope = match self.body.get("data") {
            Some(data) if data.get("dps").is_some() => data,
            _ => &self.body,
        };
        let cid = scope
            .get("cid")
            .and_then(Value::as_str)
            .map(str::to_string);
        (scope.get("dps").cloned().unwrap_or(Value::Null), cid)
    }
}

/// A Tuya device (or gateway) that answers queries and applies controls.
///
/// Each node's DPs live under its cid; the device itself uses the empty
/// string.
#[derive(Clone)]
pub struct SimDevice {
    generation: Generation,
    state: Arc<Mutex<HashMap<String, Map<String, Value>>>>,
    requests: mpsc::UnboundedSender<Request>,
}

impl SimDevice {
    pub fn new(generation: Generation, dps: Value) -> (Self, mpsc::UnboundedReceiver<Request>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut nodes = HashMap::new();
        nodes.insert(String::new(), dps.as_object().cloned().unwrap_or_default());
        let device = Self {
            generation,
            state: Arc::new(Mutex::new(nodes)),
            requests: tx,
        };
        (device, rx)
    }

    pub fn with_sub_device(self, cid: &str, dps: Value) -> Self {
        self.state
            .lock()
            .insert(cid.to_string(), dps.as_object().cloned().unwrap_or_default());
        self
    }

    async fn serve(self, mut stream: DuplexStream) {
        let key = KEY.as_bytes();
        let codec = if self.generation >= Generation::V3_4 {
            match handshake(&mut stream, self.generation).await {
                Some(session_key) => FrameCodec::new(&session_key, self.generation).unwrap(),
                None => return,
            }
        } else {
            FrameCodec::new(key, self.generation).unwrap()
        };

        loop {
            let Ok(raw) = read_frame(&mut stream, STEP).await else {
                return;
            };
            let frame = codec.decode_request(&raw).unwrap();
            let body = if frame.payload.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&frame.payload).unwrap_or(Value::Null)
            };
            let request = Request {
                seqno: frame.seqno,
                command: frame.command(),
                body,
            };
            let _ = self.requests.send(request.clone());

            let replies = self.answer(&request);
            for reply in replies {
                if stream.write_all(&codec.encode(&reply).unwrap()).await.is_err() {
                    return;
                }
            }
        }
    }

    fn answer(&self, request: &Request) -> Vec<Frame> {
        let Some(command) = request.command else {
            return Vec::new();
        };
        match command {
            CommandType::DpQuery | CommandType::DpQueryNew => {
                let cid = request
                    .body
                    .get("cid")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let dps = self
                    .state
                    .lock()
                    .get(cid.as_deref().unwrap_or(""))
                    .cloned()
                    .unwrap_or_default();
                let mut body = json!({ "dps": dps });
                if let Some(cid) = cid {
                    body["cid"] = cid.into();
                }
                vec![reply(request.seqno, command, &body)]
            }
            CommandType::Control | CommandType::ControlNew => {
                let (dps, cid) = request.dps_and_cid();
                if let Some(changes) = dps.as_object() {
                    let mut state = self.state.lock();
                    let node = state.entry(cid.clone().unwrap_or_default()).or_default();
                    node.extend(changes.clone());
                }
                let mut data = json!({ "dps": dps });
                if let Some(cid) = cid {
                    data["cid"] = cid.into();
                }
                let push = if self.generation >= Generation::V3_4 {
                    json!({ "protocol": 4, "t": 1_700_000_000u64, "data": data })
                } else {
                    data
                };
                vec![
                    Frame::new(request.seqno, command, Vec::new()).with_retcode(0),
                    reply(0, CommandType::Status, &push),
                ]
            }
            CommandType::HeartBeat => {
                vec![Frame::new(request.seqno, command, Vec::new()).with_retcode(0)]
            }
            _ => Vec::new(),
        }
    }
}

fn reply(seqno: u32, command: CommandType, body: &Value) -> Frame {
    Frame::new(seqno, command, serde_json::to_vec(body).unwrap()).with_retcode(0)
}

/// Device half of the session key negotiation.
async fn handshake(stream: &mut DuplexStream, generation: Generation) -> Option<[u8; 16]> {
    let key = KEY.as_bytes();
    let codec = FrameCodec::new(key, generation).unwrap();

    let raw = read_frame(stream, STEP).await.ok()?;
    let start = codec.decode_request(&raw).ok()?;
    let local: [u8; NONCE_LEN] = start.payload.get(..NONCE_LEN)?.try_into().ok()?;

    let remote = [0x42u8; NONCE_LEN];
    let mut payload = remote.to_vec();
    payload.extend_from_slice(&nonce_hmac(key, &local).unwrap());
    let resp = Frame::new(start.seqno, CommandType::SessKeyNegResp, payload).with_retcode(0);
    stream.write_all(&codec.encode(&resp).unwrap()).await.ok()?;

    let raw = read_frame(stream, STEP).await.ok()?;
    let finish = codec.decode_request(&raw).ok()?;
    assert_eq!(finish.command(), Some(CommandType::SessKeyNegFinish));
    assert_eq!(finish.payload, nonce_hmac(key, &remote).unwrap().to_vec());

    derive_session_key(key, generation, &local, &remote).ok()
}

#[derive(Clone)]
enum Host {
    Device(SimDevice),
    /// Accepts the connection attempt and never completes it
    Blackhole,
}

/// In-memory network keyed by device address. Unknown addresses refuse.
#[derive(Clone, Default)]
pub struct SimNetwork {
    hosts: Arc<Mutex<HashMap<String, Host>>>,
}

impl SimNetwork {
    pub fn attach(&self, address: &str, device: SimDevice) {
        self.hosts
            .lock()
            .insert(address.to_string(), Host::Device(device));
    }

    pub fn blackhole(&self, address: &str) {
        self.hosts.lock().insert(address.to_string(), Host::Blackhole);
    }
}

impl Connector for SimNetwork {
    type Stream = DuplexStream;

    async fn connect(&self, address: &str, _port: u16) -> io::Result<DuplexStream> {
        let host = self.hosts.lock().get(address).cloned();
        match host {
            Some(Host::Device(device)) => {
                let (client, server) = tokio::io::duplex(16 * 1024);
                tokio::spawn(device.serve(server));
                Ok(client)
            }
            Some(Host::Blackhole) => std::future::pending::<io::Result<DuplexStream>>().await,
            None => Err(io::Error::from(io::ErrorKind::ConnectionRefused)),
        }
    }
}

/// Broker stand-in: records publications and feeds inbound messages.
#[derive(Clone)]
pub struct SimBroker {
    published: mpsc::UnboundedSender<(String, String)>,
    subscriptions: Arc<Mutex<Vec<String>>>,
}

impl SimBroker {
    pub fn new() -> (
        Self,
        mpsc::UnboundedReceiver<(String, String)>,
        mpsc::UnboundedSender<InboundMessage>,
        impl Stream<Item = InboundMessage> + Send + 'static,
    ) {
        let (published, published_rx) = mpsc::unbounded_channel();
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<InboundMessage>();
        let inbound = async_stream::stream! {
            while let Some(message) = inbound_rx.recv().await {
                yield message;
            }
        };
        let broker = Self {
            published,
            subscriptions: Arc::default(),
        };
        (broker, published_rx, inbound_tx, inbound)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }
}

impl Messenger for SimBroker {
    async fn publish(&self, topic: &str, payload: &str) -> tuya2mqtt::Result<()> {
        let _ = self.published.send((topic.to_string(), payload.to_string()));
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> tuya2mqtt::Result<()> {
        self.subscriptions.lock().push(filter.to_string());
        Ok(())
    }
}

pub fn command(topic: &str, payload: &str) -> InboundMessage {
    InboundMessage {
        topic: topic.to_string(),
        payload: payload.as_bytes().to_vec(),
    }
}

/// Options that keep periodic traffic out of the way of the assertions.
pub fn quiet_options() -> SessionOptions {
    SessionOptions {
        poll_interval: Duration::from_secs(3600),
        heartbeat_interval: Duration::from_secs(3600),
        connect_timeout: Duration::from_secs(10),
        reconnect_min: Duration::from_millis(50),
        reconnect_max: Duration::from_millis(200),
        ..Default::default()
    }
}

/// Waits for a publication on `topic` and returns its payload.
pub async fn publication(
    rx: &mut mpsc::UnboundedReceiver<(String, String)>,
    topic: &str,
    within: Duration,
) -> String {
    timeout(within, async {
        loop {
            let (t, payload) = rx.recv().await.expect("broker closed");
            if t == topic {
                return payload;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("nothing published on {} within {:?}", topic, within))
}

/// Waits for the next control request, skipping queries and heartbeats.
pub async fn control(rx: &mut mpsc::UnboundedReceiver<Request>, within: Duration) -> Request {
    timeout(within, async {
        loop {
            let request = rx.recv().await.expect("device gone");
            if request.is_control() {
                return request;
            }
        }
    })
    .await
    .expect("no control request received")
}

/// True when no control request shows up within `within`.
pub async fn no_control(rx: &mut mpsc::UnboundedReceiver<Request>, within: Duration) -> bool {
    timeout(within, async {
        loop {
            match rx.recv().await {
                Some(request) if request.is_control() => return,
                Some(_) => {}
                None => std::future::pending::<()>().await,
            }
        }
    })
    .await
    .is_err()
}
