//! Loopback-only message bus for co-located processes.
//!
//! Speaks the subset of the NATS client protocol that publishers and
//! subscribers need (`INFO`, `CONNECT`, `PUB`, `SUB`, `UNSUB`, `PING`/`PONG`,
//! `MSG`), so sketches can use any stock NATS client without holding cloud
//! credentials. The agent itself subscribes in-process through
//! [`LocalBus::subscribe`].
//!
//! Subjects are dot-separated tokens; `*` matches one token and `>` matches
//! one or more trailing tokens.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::error::AgentError;

/// Largest `PUB` payload accepted from a client.
pub const MAX_PAYLOAD: usize = 1024 * 1024;

/// Longest protocol line (operation and arguments) accepted from a client.
pub const MAX_CONTROL_LINE: usize = 4096;

/// A message delivered to an in-process subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMessage {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Vec<u8>,
}

enum Sink {
    InProcess(mpsc::UnboundedSender<LocalMessage>),
    Client {
        conn: u64,
        sid: String,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    },
}

struct Subscription {
    pattern: String,
    sink: Sink,
}

#[derive(Default)]
struct Router {
    subs: Mutex<Vec<Subscription>>,
    next_conn: AtomicU64,
}

impl Router {
    fn add(&self, pattern: &str, sink: Sink) {
        self.subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                pattern: pattern.to_string(),
                sink,
            });
    }

    fn unsubscribe(&self, conn: u64, sid: &str) {
        self.subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|s| {
                !matches!(&s.sink, Sink::Client { conn: c, sid: id, .. } if *c == conn && id == sid)
            });
    }

    fn drop_connection(&self, conn: u64) {
        self.subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|s| !matches!(&s.sink, Sink::Client { conn: c, .. } if *c == conn));
    }

    fn route(&self, subject: &str, reply: Option<&str>, payload: &[u8]) -> usize {
        let mut subs = self.subs.lock().unwrap_or_else(PoisonError::into_inner);
        subs.retain(|s| match &s.sink {
            Sink::InProcess(tx) => !tx.is_closed(),
            Sink::Client { tx, .. } => !tx.is_closed(),
        });

        let mut delivered = 0;
        for sub in subs.iter().filter(|s| subject_matches(&s.pattern, subject)) {
            let sent = match &sub.sink {
                Sink::InProcess(tx) => tx
                    .send(LocalMessage {
                        subject: subject.to_string(),
                        reply: reply.map(str::to_string),
                        payload: payload.to_vec(),
                    })
                    .is_ok(),
                Sink::Client { sid, tx, .. } => {
                    tx.send(msg_frame(subject, sid, reply, payload)).is_ok()
                }
            };
            if sent {
                delivered += 1;
            }
        }
        delivered
    }
}

/// Handle to the bus. Cheap to clone; every clone routes through the same
/// subscription table.
#[derive(Clone, Default)]
pub struct LocalBus {
    router: Arc<Router>,
    addr: Option<SocketAddr>,
}

impl LocalBus {
    /// A bus with in-process routing only.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the bus to `addr` and start accepting clients.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::LocalBus` when `addr` is not a loopback address
    /// or cannot be bound.
    pub async fn start(addr: SocketAddr) -> Result<Self, AgentError> {
        if !addr.ip().is_loopback() {
            return Err(AgentError::LocalBus(format!(
                "{addr} is not a loopback address"
            )));
        }
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| AgentError::LocalBus(format!("cannot bind {addr}: {e}")))?;
        let local = listener
            .local_addr()
            .map_err(|e| AgentError::LocalBus(e.to_string()))?;

        let bus = Self {
            router: Arc::default(),
            addr: Some(local),
        };
        tokio::spawn(accept_loop(listener, bus.router.clone()));
        tracing::info!(addr = %local, "local bus listening");
        Ok(bus)
    }

    /// Address the bus is bound to, `None` for an in-process bus.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Receive every message whose subject matches `pattern`.
    ///
    /// The subscription ends when the receiver is dropped.
    #[must_use]
    pub fn subscribe(&self, pattern: &str) -> mpsc::UnboundedReceiver<LocalMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.router.add(pattern, Sink::InProcess(tx));
        rx
    }

    /// Fan `payload` out to every matching subscriber; returns how many
    /// subscribers it reached.
    pub fn publish(&self, subject: &str, payload: &[u8]) -> usize {
        self.router.route(subject, None, payload)
    }
}

async fn accept_loop(listener: TcpListener, router: Arc<Router>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let conn = router.next_conn.fetch_add(1, Ordering::Relaxed);
                let router = router.clone();
                tokio::spawn(async move {
                    tracing::debug!(%peer, conn, "local bus client connected");
                    if let Err(e) = serve_client(stream, &router, conn).await {
                        tracing::debug!(%peer, error = %e, "local bus client dropped");
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "local bus accept failed");
            }
        }
    }
}

async fn serve_client(stream: TcpStream, router: &Router, conn: u64) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let _ = tx.send(info_frame());
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let result = loop {
        line.clear();
        let limit = MAX_CONTROL_LINE as u64;
        let read = (&mut reader).take(limit).read_line(&mut line).await;
        match read {
            Ok(0) => break Ok(()),
            Ok(n) if n == MAX_CONTROL_LINE && !line.ends_with('\n') => {
                let _ = tx.send(format!("-ERR '{ERR_CONTROL_LINE}'\r\n").into_bytes());
                break Ok(());
            }
            Ok(_) => {}
            Err(e) => break Err(e),
        }
        match parse_op(line.trim_end_matches(['\r', '\n'])) {
            Ok(Op::Connect | Op::Pong) => {}
            Ok(Op::Ping) => {
                let _ = tx.send(b"PONG\r\n".to_vec());
            }
            Ok(Op::Sub { subject, sid }) => router.add(
                &subject,
                Sink::Client {
                    conn,
                    sid,
                    tx: tx.clone(),
                },
            ),
            Ok(Op::Unsub { sid }) => router.unsubscribe(conn, &sid),
            Ok(Op::Pub {
                subject,
                reply,
                len,
            }) => {
                let mut buf = vec![0u8; len + 2];
                if let Err(e) = reader.read_exact(&mut buf).await {
                    break Err(e);
                }
                // The payload must be followed by CRLF; otherwise the stream is
                // out of step with the framing.
                if !buf.ends_with(b"\r\n") {
                    let _ = tx.send(format!("-ERR '{ERR_SYNTAX}'\r\n").into_bytes());
                    break Ok(());
                }
                buf.truncate(len);
                router.route(&subject, reply.as_deref(), &buf);
            }
            Err(reason) => {
                let _ = tx.send(format!("-ERR '{reason}'\r\n").into_bytes());
                if reason == ERR_PAYLOAD {
                    break Ok(());
                }
            }
        }
    };

    drop(tx);
    router.drop_connection(conn);
    let _ = writer.await;
    result
}

fn info_frame() -> Vec<u8> {
    let info = serde_json::json!({
        "server_id": "connector-agent",
        "version": env!("CARGO_PKG_VERSION"),
        "proto": 0,
        "max_payload": MAX_PAYLOAD,
        "headers": false,
    });
    format!("INFO {info}\r\n").into_bytes()
}

fn msg_frame(subject: &str, sid: &str, reply: Option<&str>, payload: &[u8]) -> Vec<u8> {
    let header = match reply {
        Some(reply) => format!("MSG {subject} {sid} {reply} {}\r\n", payload.len()),
        None => format!("MSG {subject} {sid} {}\r\n", payload.len()),
    };
    let mut frame = Vec::with_capacity(header.len() + payload.len() + 2);
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(payload);
    frame.extend_from_slice(b"\r\n");
    frame
}

const ERR_UNKNOWN: &str = "Unknown Protocol Operation";
const ERR_PAYLOAD: &str = "Maximum Payload Violation";
const ERR_SYNTAX: &str = "Invalid Arguments";
const ERR_CONTROL_LINE: &str = "Maximum Control Line Exceeded";

#[derive(Debug, PartialEq, Eq)]
enum Op {
    Connect,
    Ping,
    Pong,
    Sub { subject: String, sid: String },
    Unsub { sid: String },
    Pub { subject: String, reply: Option<String>, len: usize },
}

fn parse_op(line: &str) -> Result<Op, &'static str> {
    let mut parts = line.split_whitespace();
    let verb = parts.next().ok_or(ERR_UNKNOWN)?.to_ascii_uppercase();
    let args: Vec<&str> = parts.collect();
    match (verb.as_str(), args.as_slice()) {
        ("CONNECT", _) => Ok(Op::Connect),
        ("PING", []) => Ok(Op::Ping),
        ("PONG", []) => Ok(Op::Pong),
        // SUB <subject> [queue group] <sid>; queue groups are accepted but
        // every member receives every message.
        ("SUB", [subject, sid] | [subject, _, sid]) => Ok(Op::Sub {
            subject: (*subject).to_string(),
            sid: (*sid).to_string(),
        }),
        ("UNSUB", [sid] | [sid, _]) => Ok(Op::Unsub {
            sid: (*sid).to_string(),
        }),
        ("PUB", [subject, len]) => pub_op(subject, None, len),
        ("PUB", [subject, reply, len]) => pub_op(subject, Some(*reply), len),
        ("PING" | "PONG" | "SUB" | "UNSUB" | "PUB", _) => Err(ERR_SYNTAX),
        _ => Err(ERR_UNKNOWN),
    }
}

fn pub_op(subject: &str, reply: Option<&str>, len: &str) -> Result<Op, &'static str> {
    if subject.contains(['*', '>']) {
        return Err(ERR_SYNTAX);
    }
    let len: usize = len.parse().map_err(|_| ERR_SYNTAX)?;
    if len > MAX_PAYLOAD {
        return Err(ERR_PAYLOAD);
    }
    Ok(Op::Pub {
        subject: subject.to_string(),
        reply: reply.map(str::to_string),
        len,
    })
}

/// Whether `subject` is matched by the subscription `pattern`.
#[must_use]
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
