//! In-process stand-ins for the mailbox server and the transit relay
#![allow(dead_code)]

use async_std::{
    net::{TcpListener, TcpStream},
    task,
};
use futures::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, StreamExt, io::BufReader};
use serde_json::{Value, json};
use std::{
    collections::HashMap,
    net::Shutdown,
    path::PathBuf,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};
use wormhole_engine::{
    Code, EventStream, ReceiveHandle, TransferEvent, WormholeConfig, transit::Abilities,
};

pub const MOTD: &str = "Welcome to the test server";

#[derive(Default)]
struct Mailbox {
    messages: Vec<Value>,
    listeners: Vec<async_channel::Sender<String>>,
}

#[derive(Default)]
struct ServerState {
    next_nameplate: u32,
    nameplates: HashMap<String, String>,
    mailboxes: HashMap<String, Mailbox>,
}

impl ServerState {
    fn mailbox_of(&mut self, nameplate: &str) -> String {
        self.nameplates
            .entry(nameplate.to_string())
            .or_insert_with(|| format!("mailbox-{}", nameplate))
            .clone()
    }
}

fn send(tx: &async_channel::Sender<String>, message: Value) {
    let _ = tx.try_send(format!("{}\n", message));
}

/// A mailbox server speaking JSON lines over TCP. Nameplates are allocated from `first_nameplate` upwards.
pub async fn start_mailbox_server(first_nameplate: u32) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let state = Arc::new(Mutex::new(ServerState {
        next_nameplate: first_nameplate,
        ..ServerState::default()
    }));

    task::spawn(async move {
        let mut incoming = listener.incoming();
        while let Some(Ok(stream)) = incoming.next().await {
            task::spawn(serve_client(stream, state.clone()));
        }
    });

    format!("tcp://127.0.0.1:{}", port)
}

async fn serve_client(stream: TcpStream, state: Arc<Mutex<ServerState>>) {
    let (tx, rx) = async_channel::unbounded::<String>();
    let mut writer = stream.clone();
    task::spawn(async move {
        while let Ok(line) = rx.recv().await {
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    send(&tx, json!({"type": "welcome", "welcome": {"motd": MOTD}}));

    let mut lines = BufReader::new(stream).lines();
    let mut side = String::new();
    while let Some(Ok(line)) = lines.next().await {
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            send(&tx, json!({"type": "error", "error": "invalid JSON"}));
            continue;
        };
        send(&tx, json!({"type": "ack", "id": message["id"]}));

        let mut state = state.lock().unwrap();
        match message["type"].as_str().unwrap_or_default() {
            "bind" => side = message["side"].as_str().unwrap_or_default().to_string(),
            "allocate" => {
                let nameplate = state.next_nameplate.to_string();
                state.next_nameplate += 1;
                state.mailbox_of(&nameplate);
                send(&tx, json!({"type": "allocated", "nameplate": nameplate}));
            },
            "claim" => {
                let nameplate = message["nameplate"].as_str().unwrap_or_default();
                let mailbox = state.mailbox_of(nameplate);
                send(&tx, json!({"type": "claimed", "mailbox": mailbox}));
            },
            "release" => send(&tx, json!({"type": "released"})),
            "open" => {
                let mailbox_id = message["mailbox"].as_str().unwrap_or_default().to_string();
                let mailbox = state.mailboxes.entry(mailbox_id).or_default();
                for old in &mailbox.messages {
                    send(&tx, old.clone());
                }
                mailbox.listeners.push(tx.clone());
            },
            "add" => {
                let relayed = json!({
                    "type": "message",
                    "side": side,
                    "phase": message["phase"],
                    "body": message["body"],
                    "id": message["id"],
                });
                /* Every client has at most one mailbox open */
                for mailbox in state.mailboxes.values_mut() {
                    if mailbox.listeners.iter().any(|listener| listener.same_channel(&tx)) {
                        mailbox.messages.push(relayed.clone());
                        for listener in &mailbox.listeners {
                            send(listener, relayed.clone());
                        }
                    }
                }
            },
            "close" => {
                for mailbox in state.mailboxes.values_mut() {
                    mailbox.listeners.retain(|listener| !listener.same_channel(&tx));
                }
                send(&tx, json!({"type": "closed"}));
            },
            "ping" => send(&tx, json!({"type": "pong", "pong": message["ping"]})),
            other => send(&tx, json!({"type": "error", "error": format!("unknown type {}", other)})),
        }
    }

    let mut state = state.lock().unwrap();
    for mailbox in state.mailboxes.values_mut() {
        mailbox.listeners.retain(|listener| !listener.same_channel(&tx));
    }
}

/// A mailbox server for exactly one client, answering each request with whatever `script` returns
///
/// Acks are part of the script. Every request is also passed on to the returned channel.
pub async fn start_scripted_server<F>(mut script: F) -> (String, async_channel::Receiver<Value>)
where
    F: FnMut(&Value) -> Vec<Value> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (seen_tx, seen_rx) = async_channel::unbounded();

    task::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let mut writer = stream.clone();
        let mut frames = vec![json!({"type": "welcome", "welcome": {}})];
        let mut lines = BufReader::new(stream).lines();
        loop {
            for frame in frames.drain(..) {
                if writer.write_all(format!("{}\n", frame).as_bytes()).await.is_err() {
                    return;
                }
            }
            let Some(Ok(line)) = lines.next().await else {
                return;
            };
            let Ok(request) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            frames = script(&request);
            let _ = seen_tx.try_send(request);
        }
    });

    (format!("tcp://127.0.0.1:{}", port), seen_rx)
}

/// What a well-behaved server answers, ack first
pub fn regular_reply(request: &Value) -> Vec<Value> {
    let ack = json!({"type": "ack", "id": request["id"]});
    let reply = match request["type"].as_str().unwrap_or_default() {
        "allocate" => json!({"type": "allocated", "nameplate": "5"}),
        "claim" => json!({"type": "claimed", "mailbox": "mailbox-5"}),
        "release" => json!({"type": "released"}),
        "close" => json!({"type": "closed"}),
        "ping" => json!({"type": "pong", "pong": request["ping"]}),
        _ => return vec![ack],
    };
    vec![ack, reply]
}

/// A relayed mailbox message with a plaintext body
pub fn mailbox_message(side: &str, phase: &str, body: &[u8]) -> Value {
    json!({
        "type": "message",
        "side": side,
        "phase": phase,
        "body": hex::encode(body),
        "id": null,
    })
}

/// A transit relay that pairs connections presenting the same token, like the public one
///
/// With `corrupt_at`, the byte at that offset of each spliced direction gets flipped.
pub async fn start_relay(corrupt_at: Option<u64>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let waiting: Arc<Mutex<HashMap<String, (String, TcpStream)>>> = Arc::default();

    task::spawn(async move {
        let mut incoming = listener.incoming();
        while let Some(Ok(stream)) = incoming.next().await {
            task::spawn(relay_client(stream, waiting.clone(), corrupt_at));
        }
    });

    format!("tcp://127.0.0.1:{}", port)
}

async fn read_line(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8];
    while byte[0] != b'\n' {
        stream.read_exact(&mut byte).await?;
        line.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

async fn relay_client(
    mut stream: TcpStream,
    waiting: Arc<Mutex<HashMap<String, (String, TcpStream)>>>,
    corrupt_at: Option<u64>,
) {
    let Ok(line) = read_line(&mut stream).await else {
        return;
    };
    let words: Vec<&str> = line.trim_end().split(' ').collect();
    let ["please", "relay", token, "for", "side", side] = words[..] else {
        let _ = stream.write_all(b"bad handshake\n").await;
        return;
    };

    let peer = {
        let mut waiting = waiting.lock().unwrap();
        match waiting.remove(token) {
            Some((other_side, peer)) if other_side != side => Some(peer),
            _ => {
                waiting.insert(token.to_string(), (side.to_string(), stream.clone()));
                None
            },
        }
    };
    let Some(mut peer) = peer else {
        return;
    };

    if peer.write_all(b"ok\n").await.is_err() || stream.write_all(b"ok\n").await.is_err() {
        return;
    }
    task::spawn(splice(peer.clone(), stream.clone(), corrupt_at));
    task::spawn(splice(stream, peer, corrupt_at));
}

async fn splice(mut from: TcpStream, mut to: TcpStream, corrupt_at: Option<u64>) {
    let mut buffer = vec![0u8; 16 * 1024];
    let mut offset = 0u64;
    loop {
        let n = match from.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if let Some(at) = corrupt_at {
            if (offset..offset + n as u64).contains(&at) {
                buffer[(at - offset) as usize] ^= 0x40;
            }
        }
        offset += n as u64;
        if to.write_all(&buffer[..n]).await.is_err() {
            break;
        }
    }
    let _ = to.shutdown(Shutdown::Write);
}

/// Serves its data up to `stall_at`, then never makes progress again
pub struct StallingReader {
    data: Vec<u8>,
    position: usize,
    stall_at: usize,
}

impl StallingReader {
    pub fn new(data: Vec<u8>, stall_at: usize) -> Self {
        StallingReader {
            data,
            position: 0,
            stall_at,
        }
    }
}

impl AsyncRead for StallingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        if this.position >= this.stall_at {
            return Poll::Pending;
        }
        let end = (this.position + buf.len()).min(this.stall_at);
        let n = end - this.position;
        buf[..n].copy_from_slice(&this.data[this.position..end]);
        this.position = end;
        Poll::Ready(Ok(n))
    }
}

pub fn test_config(mailbox_url: &str, relay_url: &str) -> WormholeConfig {
    WormholeConfig::default()
        .rendezvous_url(mailbox_url)
        .relay_url(relay_url)
        .abilities(Abilities::FORCE_RELAY)
        .connect_timeout(Duration::from_secs(5))
        .server_timeout(Duration::from_secs(5))
        .peer_timeout(Duration::from_secs(20))
        .record_timeout(Duration::from_secs(20))
}

/// Not very random, but every byte position matters
pub fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub fn temp_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("wormhole-engine-test-{:016x}", rand::random::<u64>()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn dir_entries(dir: &PathBuf) -> Vec<String> {
    let mut entries: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    entries.sort();
    entries
}

/// Wait for the sender's code
pub async fn wait_for_code(events: &EventStream, seen: &mut Vec<TransferEvent>) -> Code {
    loop {
        let event = events.recv().await.expect("Sender ended without a code");
        if let TransferEvent::Code(code) = &event {
            let code = code.clone();
            seen.push(event);
            return code;
        }
        seen.push(event);
    }
}

/// All remaining events of a session
pub async fn collect(events: EventStream, mut seen: Vec<TransferEvent>) -> Vec<TransferEvent> {
    while let Ok(event) = events.recv().await {
        seen.push(event);
    }
    seen
}

/// Run a receiver to the end, answering the offer with `accept`
pub async fn drive_receiver(
    handle: ReceiveHandle,
    events: EventStream,
    accept: bool,
) -> Vec<TransferEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.recv().await {
        if let TransferEvent::OfferReceived(_) = &event {
            handle.confirm_offer(accept);
        }
        seen.push(event);
    }
    seen
}

pub fn verifier(events: &[TransferEvent]) -> Option<&str> {
    events.iter().find_map(|event| match event {
        TransferEvent::PeerConnected { verifier } => Some(verifier.as_str()),
        _ => None,
    })
}

pub fn reached(events: &[TransferEvent], state: wormhole_engine::SessionState) -> bool {
    events
        .iter()
        .any(|event| matches!(event, TransferEvent::StateChanged(s) if *s == state))
}
