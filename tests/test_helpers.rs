//! Test helpers for integration tests
//!
//! A small in-process NATS server: it sends INFO, answers PING, records
//! every control line, and routes PUB/HPUB to matching SUBs as MSG/HMSG.
//! It can be killed to exercise reconnects.

#![allow(dead_code)]

use nats_core_client::{Event, Options};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Server behaviour knobs
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub server_id: String,
    pub max_payload: usize,
    /// Extra INFO JSON members, e.g. `"ldm":true`
    pub extra_info: Option<String>,
    /// Reject CONNECT with an authorization violation
    pub reject_auth: bool,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            server_id: "mock".to_string(),
            max_payload: 1024 * 1024,
            extra_info: None,
            reject_auth: false,
        }
    }
}

struct MockSub {
    subject: String,
    queue: Option<String>,
    max: Option<u64>,
    delivered: u64,
}

struct Client {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    subs: HashMap<u64, MockSub>,
}

#[derive(Default)]
struct Shared {
    lines: Mutex<Vec<String>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    clients: Mutex<HashMap<u64, Client>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_client: AtomicU64,
    ignore_pings: AtomicBool,
}

/// In-process NATS server bound to 127.0.0.1
pub struct MockNatsServer {
    pub port: u16,
    config: MockConfig,
    shared: Arc<Shared>,
    listener: Option<JoinHandle<()>>,
}

impl MockNatsServer {
    /// Start on an ephemeral port
    pub async fn start() -> Self {
        Self::start_with(0, MockConfig::default()).await
    }

    /// Start on a specific port, e.g. one from [`reserve_port`]
    pub async fn start_on(port: u16) -> Self {
        Self::start_with(port, MockConfig::default()).await
    }

    pub async fn start_with(port: u16, config: MockConfig) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .expect("bind mock server");
        let port = listener.local_addr().expect("local addr").port();
        let shared = Arc::new(Shared::default());

        let accept_shared = Arc::clone(&shared);
        let accept_config = config.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let id = accept_shared.next_client.fetch_add(1, Ordering::Relaxed);
                let task = tokio::spawn(serve_client(
                    Arc::clone(&accept_shared),
                    accept_config.clone(),
                    id,
                    stream,
                ));
                accept_shared.tasks.lock().unwrap().push(task);
            }
        });

        Self {
            port,
            config,
            shared,
            listener: Some(handle),
        }
    }

    pub fn url(&self) -> String {
        format!("nats://127.0.0.1:{}", self.port)
    }

    /// Every control line received so far, in order
    pub fn lines(&self) -> Vec<String> {
        self.shared.lines.lock().unwrap().clone()
    }

    /// Control lines starting with `prefix`
    pub fn lines_starting_with(&self, prefix: &str) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|l| l.starts_with(prefix))
            .collect()
    }

    /// Published (subject, payload) pairs, in order
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.shared.published.lock().unwrap().clone()
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients.lock().unwrap().len()
    }

    /// Stop answering PINGs so the client sees a stale connection
    pub fn ignore_pings(&self, ignore: bool) {
        self.shared.ignore_pings.store(ignore, Ordering::Relaxed);
    }

    /// Write raw protocol bytes to every connected client
    pub fn send_raw(&self, bytes: &[u8]) {
        for client in self.shared.clients.lock().unwrap().values() {
            let _ = client.tx.send(bytes.to_vec());
        }
    }

    /// Send an INFO update with the given `connect_urls`
    pub fn send_info_update(&self, connect_urls: &[String]) {
        let urls = serde_json::to_string(connect_urls).unwrap();
        let line = format!(
            "INFO {{\"server_id\":\"{}\",\"max_payload\":{},\"headers\":true,\"connect_urls\":{}}}\r\n",
            self.config.server_id, self.config.max_payload, urls
        );
        self.send_raw(line.as_bytes());
    }

    /// Drop every client connection, keeping the listener
    pub fn drop_clients(&self) {
        for task in self.shared.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.shared.clients.lock().unwrap().clear();
    }

    /// Stop listening and drop every client
    pub fn kill(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        self.drop_clients();
    }

    /// Wait until a control line satisfying `pred` has been received
    pub async fn wait_for_line<F>(&self, pred: F, timeout: Duration) -> bool
    where
        F: Fn(&str) -> bool,
    {
        wait_until(|| self.lines().iter().any(|l| pred(l)), timeout).await
    }
}

impl Drop for MockNatsServer {
    fn drop(&mut self) {
        self.kill();
    }
}

fn info_line(config: &MockConfig) -> String {
    let extra = config
        .extra_info
        .as_deref()
        .map(|e| format!(",{e}"))
        .unwrap_or_default();
    format!(
        "INFO {{\"server_id\":\"{}\",\"version\":\"2.10.0\",\"proto\":1,\"headers\":true,\"max_payload\":{}{}}}\r\n",
        config.server_id, config.max_payload, extra
    )
}

async fn serve_client(shared: Arc<Shared>, config: MockConfig, id: u64, stream: TcpStream) {
    let (read, mut write) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let _ = tx.send(info_line(&config).into_bytes());
    shared.clients.lock().unwrap().insert(
        id,
        Client {
            tx: tx.clone(),
            subs: HashMap::new(),
        },
    );

    let writer = async move {
        while let Some(bytes) = rx.recv().await {
            if write.write_all(&bytes).await.is_err() {
                break;
            }
        }
    };
    let reader = read_commands(&shared, &config, id, &tx, BufReader::new(read));

    tokio::select! {
        () = writer => {}
        () = reader => {}
    }
    shared.clients.lock().unwrap().remove(&id);
}

async fn read_commands(
    shared: &Shared,
    config: &MockConfig,
    id: u64,
    tx: &mpsc::UnboundedSender<Vec<u8>>,
    mut reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
) {
    loop {
        let mut raw = String::new();
        match reader.read_line(&mut raw).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let line = raw.trim_end_matches(['\r', '\n']).to_string();
        if line.is_empty() {
            continue;
        }
        shared.lines.lock().unwrap().push(line.clone());

        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts[0].to_ascii_uppercase().as_str() {
            "CONNECT" => {
                if config.reject_auth {
                    let _ = tx.send(b"-ERR 'Authorization Violation'\r\n".to_vec());
                    return;
                }
            }
            "PING" => {
                if !shared.ignore_pings.load(Ordering::Relaxed) {
                    let _ = tx.send(b"PONG\r\n".to_vec());
                }
            }
            "SUB" => {
                let (subject, queue, sid) = match parts.len() {
                    3 => (parts[1], None, parts[2]),
                    4 => (parts[1], Some(parts[2]), parts[3]),
                    _ => continue,
                };
                let Ok(sid) = sid.parse() else { continue };
                if let Some(client) = shared.clients.lock().unwrap().get_mut(&id) {
                    client.subs.insert(
                        sid,
                        MockSub {
                            subject: subject.to_string(),
                            queue: queue.map(str::to_string),
                            max: None,
                            delivered: 0,
                        },
                    );
                }
            }
            "UNSUB" => {
                let Some(Ok(sid)) = parts.get(1).map(|s| s.parse::<u64>()) else {
                    continue;
                };
                let max = parts.get(2).and_then(|m| m.parse::<u64>().ok());
                if let Some(client) = shared.clients.lock().unwrap().get_mut(&id) {
                    match (max, client.subs.get_mut(&sid)) {
                        (Some(max), Some(sub)) if sub.delivered < max => sub.max = Some(max),
                        _ => {
                            client.subs.remove(&sid);
                        }
                    }
                }
            }
            "PUB" | "HPUB" => {
                let hpub = parts[0].eq_ignore_ascii_case("HPUB");
                let sizes = if hpub { 2 } else { 1 };
                if parts.len() < 2 + sizes {
                    continue;
                }
                let subject = parts[1].to_string();
                let reply = (parts.len() == 3 + sizes).then(|| parts[2].to_string());
                let Ok(total) = parts[parts.len() - 1].parse::<usize>() else {
                    continue;
                };
                let header_len = if hpub {
                    parts[parts.len() - 2].parse::<usize>().unwrap_or(0)
                } else {
                    0
                };
                let mut body = vec![0u8; total + 2];
                if reader.read_exact(&mut body).await.is_err() {
                    return;
                }
                body.truncate(total);
                shared
                    .published
                    .lock()
                    .unwrap()
                    .push((subject.clone(), body[header_len..].to_vec()));
                route(shared, &subject, reply.as_deref(), header_len, &body);
            }
            _ => {}
        }
    }
}

/// NATS subject matching with `*` and `>` wildcards
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

fn frame(subject: &str, sid: u64, reply: Option<&str>, header_len: usize, body: &[u8]) -> Vec<u8> {
    let reply = reply.map(|r| format!("{r} ")).unwrap_or_default();
    let mut out = if header_len > 0 {
        format!("HMSG {subject} {sid} {reply}{header_len} {}\r\n", body.len())
    } else {
        format!("MSG {subject} {sid} {reply}{}\r\n", body.len())
    }
    .into_bytes();
    out.extend_from_slice(body);
    out.extend_from_slice(b"\r\n");
    out
}

fn route(shared: &Shared, subject: &str, reply: Option<&str>, header_len: usize, body: &[u8]) {
    let mut clients = shared.clients.lock().unwrap();
    let mut groups = HashSet::new();
    let mut delivered = false;

    let mut ids: Vec<u64> = clients.keys().copied().collect();
    ids.sort_unstable();
    for id in ids {
        let Some(client) = clients.get_mut(&id) else { continue };
        let mut sids: Vec<u64> = client.subs.keys().copied().collect();
        sids.sort_unstable();
        let mut finished = Vec::new();
        for sid in sids {
            let sub = client.subs.get_mut(&sid).unwrap();
            if !subject_matches(&sub.subject, subject) {
                continue;
            }
            if let Some(queue) = &sub.queue
                && !groups.insert(queue.clone())
            {
                continue;
            }
            let _ = client.tx.send(frame(subject, sid, reply, header_len, body));
            delivered = true;
            sub.delivered += 1;
            if sub.max.is_some_and(|max| sub.delivered >= max) {
                finished.push(sid);
            }
        }
        for sid in finished {
            client.subs.remove(&sid);
        }
    }

    // No subscribers for a request: answer with a 503 status on the reply subject
    if !delivered && let Some(reply) = reply {
        let status = b"NATS/1.0 503\r\n\r\n";
        for client in clients.values() {
            for (sid, sub) in &client.subs {
                if subject_matches(&sub.subject, reply) {
                    let _ = client.tx.send(frame(reply, *sid, None, status.len(), status));
                }
            }
        }
    }
}

/// Server that completes the handshake and then never reads again
///
/// Accepted sockets stay open, so a client writing enough data ends up
/// blocked on a full send buffer.
pub struct StalledServer {
    pub port: u16,
    accepted: Arc<AtomicU64>,
    listener: JoinHandle<()>,
}

impl StalledServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("bind stalled server");
        let port = listener.local_addr().expect("local addr").port();
        let accepted = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&accepted);
        let listener = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Some(stream) = handshake_then_stall(stream).await {
                    held.push(stream);
                }
            }
        });
        Self {
            port,
            accepted,
            listener,
        }
    }

    pub fn url(&self) -> String {
        format!("nats://127.0.0.1:{}", self.port)
    }

    /// Connections accepted so far
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for StalledServer {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn handshake_then_stall(mut stream: TcpStream) -> Option<TcpStream> {
    let config = MockConfig {
        max_payload: 8 * 1024 * 1024,
        ..MockConfig::default()
    };
    stream.write_all(info_line(&config).as_bytes()).await.ok()?;
    let mut reader = BufReader::new(stream);
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        if line.trim_end().eq_ignore_ascii_case("PING") {
            break;
        }
    }
    let mut stream = reader.into_inner();
    stream.write_all(b"PONG\r\n").await.ok()?;
    Some(stream)
}

/// Find a free port and release it for a server started later
pub fn reserve_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

/// Options tuned for fast tests against the mock server
pub fn test_options<S: Into<String>>(servers: impl IntoIterator<Item = S>) -> Options {
    Options {
        no_randomize: true,
        connect_timeout: Duration::from_millis(500),
        reconnect_wait: Duration::from_millis(50),
        reconnect_jitter: Duration::ZERO,
        flush_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        drain_timeout: Duration::from_secs(2),
        ..Options::with_servers(servers)
    }
}

/// Attach an event callback that forwards events to a channel
pub fn with_event_channel(opts: Options) -> (Options, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let opts = opts.event_callback(move |event| {
        let _ = tx.send(event);
    });
    (opts, rx)
}

/// Wait for an event matching `pred`, skipping others
pub async fn wait_for_event<F>(
    rx: &mut mpsc::UnboundedReceiver<Event>,
    pred: F,
    timeout: Duration,
) -> Option<Event>
where
    F: Fn(&Event) -> bool,
{
    tokio::time::timeout(timeout, async {
        while let Some(event) = rx.recv().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// Poll `cond` every 10ms until it holds or `timeout` elapses
pub async fn wait_until<F>(cond: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
