/// In-process Redis and Memcache servers for tests
///
/// Each server listens on `127.0.0.1:0` and keeps its data in memory. It
/// speaks just enough of each protocol for the clients in this crate.
use crate::clients::redis::resp::{RespEncoder, RespValue};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Key suffix whose `GET` is answered with an invalid RESP sigil
pub const CORRUPT_KEY: &str = "__corrupt__";
/// Key suffix whose memcache store is answered with a `SERVER_ERROR`
pub const SERVER_ERROR_KEY: &str = "__server_error__";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Redis,
    Memcache,
}

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    flags: u32,
    cas: u64,
    ttl: i64,
    stored: Instant,
}

impl Entry {
    /// Memcache expiry; redis ttls are only reported back
    fn is_live(&self) -> bool {
        self.ttl <= 0 || self.stored.elapsed() < Duration::from_secs(self.ttl as u64)
    }
}

struct Shared {
    kind: Kind,
    data: Mutex<HashMap<String, Entry>>,
    commands: Mutex<Vec<String>>,
    readonly: AtomicBool,
    cas: AtomicU64,
    kill: watch::Sender<u64>,
}

impl Shared {
    fn next_cas(&self) -> u64 {
        self.cas.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn store(&self, key: &str, value: Bytes, flags: u32, ttl: i64) {
        let cas = self.next_cas();
        self.data.lock().insert(
            key.to_string(),
            Entry {
                value,
                flags,
                cas,
                ttl,
                stored: Instant::now(),
            },
        );
    }
}

pub struct FakeServer {
    addr: String,
    shared: Arc<Shared>,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl FakeServer {
    pub async fn redis() -> Self {
        Self::start(Kind::Redis).await
    }

    pub async fn memcache() -> Self {
        Self::start(Kind::Memcache).await
    }

    async fn start(kind: Kind) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (kill, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            kind,
            data: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            readonly: AtomicBool::new(false),
            cas: AtomicU64::new(0),
            kill,
        });

        let accept_shared = Arc::clone(&shared);
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let shared = Arc::clone(&accept_shared);
                tokio::spawn(serve(stream, shared));
            }
        });

        Self {
            addr,
            shared,
            accept: Mutex::new(Some(accept)),
        }
    }

    /// An address nothing listens on
    pub async fn unused_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Reject writes the way a Redis replica does
    pub fn set_readonly(&self, readonly: bool) {
        self.shared.readonly.store(readonly, Ordering::SeqCst);
    }

    /// Close every open client connection
    pub fn drop_connections(&self) {
        self.shared.kill.send_modify(|generation| *generation += 1);
    }

    /// Stop listening and close every connection
    pub async fn stop(&self) {
        let handle = self.accept.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        self.drop_connections();
    }

    /// Upper-cased command names received so far
    pub fn commands(&self) -> Vec<String> {
        self.shared.commands.lock().clone()
    }

    pub fn value(&self, key: &str) -> Option<Bytes> {
        self.shared.data.lock().get(key).map(|e| e.value.clone())
    }

    pub fn ttl(&self, key: &str) -> Option<i64> {
        self.shared.data.lock().get(key).map(|e| e.ttl)
    }

    pub fn put(&self, key: &str, value: &str) {
        self.shared.store(key, Bytes::copy_from_slice(value.as_bytes()), 0, 0);
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        if let Some(handle) = self.accept.lock().take() {
            handle.abort();
        }
        self.drop_connections();
    }
}

async fn serve(stream: TcpStream, shared: Arc<Shared>) {
    let mut kill = shared.kill.subscribe();
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    loop {
        let reply = tokio::select! {
            _ = kill.changed() => break,
            reply = handle_request(&mut reader, &shared) => reply,
        };
        match reply {
            Ok(Some(reply)) => {
                if write.write_all(&reply).await.is_err() {
                    break;
                }
            }
            _ => break,
        }
    }
}

async fn handle_request(reader: &mut BufReader<OwnedReadHalf>, shared: &Shared) -> io::Result<Option<Bytes>> {
    match shared.kind {
        Kind::Redis => {
            let Some(args) = read_resp_command(reader).await? else {
                return Ok(None);
            };
            let mut buf = BytesMut::new();
            match redis_reply(shared, &args) {
                Some(value) => RespEncoder::encode_into(&mut buf, &value),
                None => buf.extend_from_slice(b"!garbage\r\n"),
            }
            Ok(Some(buf.freeze()))
        }
        Kind::Memcache => {
            let Some(line) = read_line(reader).await? else {
                return Ok(None);
            };
            memcache_reply(reader, shared, &line).await.map(Some)
        }
    }
}

async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> io::Result<Option<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn read_block(reader: &mut BufReader<OwnedReadHalf>, len: usize) -> io::Result<Bytes> {
    let mut data = vec![0u8; len + 2];
    reader.read_exact(&mut data).await?;
    data.truncate(len);
    Ok(Bytes::from(data))
}

async fn read_resp_command(reader: &mut BufReader<OwnedReadHalf>) -> io::Result<Option<Vec<Bytes>>> {
    let Some(header) = read_line(reader).await? else {
        return Ok(None);
    };
    let argc: usize = header.trim_start_matches('*').parse().unwrap_or(0);

    let mut args = Vec::with_capacity(argc);
    for _ in 0..argc {
        let Some(size) = read_line(reader).await? else {
            return Ok(None);
        };
        let len: usize = size.trim_start_matches('$').parse().unwrap_or(0);
        args.push(read_block(reader, len).await?);
    }
    Ok(Some(args))
}

fn text(data: &Bytes) -> String {
    String::from_utf8_lossy(data).into_owned()
}

fn redis_reply(shared: &Shared, args: &[Bytes]) -> Option<RespValue> {
    let cmd = args.first().map(text).unwrap_or_default().to_uppercase();
    shared.commands.lock().push(cmd.clone());
    let key = args.get(1).map(text).unwrap_or_default();

    let reply = match cmd.as_str() {
        "PING" => RespValue::SimpleString("PONG".into()),
        "AUTH" | "SELECT" => RespValue::SimpleString("OK".into()),
        "GET" if key.ends_with(CORRUPT_KEY) => return None,
        "GET" => RespValue::BulkString(shared.data.lock().get(&key).map(|e| e.value.clone())),
        "MGET" => {
            let data = shared.data.lock();
            RespValue::Array(Some(
                args[1..]
                    .iter()
                    .map(|k| RespValue::BulkString(data.get(&text(k)).map(|e| e.value.clone())))
                    .collect(),
            ))
        }
        "SET" if shared.readonly.load(Ordering::SeqCst) => {
            RespValue::Error("READONLY You can't write against a read only replica.".into())
        }
        "SET" => {
            let options: Vec<String> = args[3..].iter().map(|a| text(a).to_uppercase()).collect();
            let ttl = options
                .iter()
                .position(|o| o == "EX")
                .and_then(|i| options.get(i + 1))
                .and_then(|v| v.parse().ok())
                .unwrap_or(-1);
            let nx = options.iter().any(|o| o == "NX");
            if nx && shared.data.lock().contains_key(&key) {
                RespValue::BulkString(None)
            } else {
                shared.store(&key, args[2].clone(), 0, ttl);
                RespValue::SimpleString("OK".into())
            }
        }
        "DEL" => {
            let mut data = shared.data.lock();
            let removed = args[1..].iter().filter(|k| data.remove(&text(k)).is_some()).count();
            RespValue::Integer(removed as i64)
        }
        "EXISTS" => {
            let data = shared.data.lock();
            let found = args[1..].iter().filter(|k| data.contains_key(&text(k))).count();
            RespValue::Integer(found as i64)
        }
        "INCR" | "INCRBY" => {
            let delta: i64 = match cmd.as_str() {
                "INCR" => 1,
                _ => args.get(2).map(text).and_then(|d| d.parse().ok()).unwrap_or(0),
            };
            let mut data = shared.data.lock();
            let current = data.get(&key).map(|e| text(&e.value).parse::<i64>());
            match current {
                Some(Err(_)) => RespValue::Error("ERR value is not an integer or out of range".into()),
                current => {
                    let value = current.and_then(Result::ok).unwrap_or(0) + delta;
                    let cas = shared.next_cas();
                    let ttl = data.get(&key).map_or(-1, |e| e.ttl);
                    data.insert(
                        key,
                        Entry {
                            value: Bytes::from(value.to_string()),
                            flags: 0,
                            cas,
                            ttl,
                            stored: Instant::now(),
                        },
                    );
                    RespValue::Integer(value)
                }
            }
        }
        "EXPIRE" => {
            let secs: i64 = args.get(2).map(text).and_then(|d| d.parse().ok()).unwrap_or(0);
            match shared.data.lock().get_mut(&key) {
                Some(entry) => {
                    entry.ttl = secs;
                    RespValue::Integer(1)
                }
                None => RespValue::Integer(0),
            }
        }
        "TTL" => RespValue::Integer(shared.data.lock().get(&key).map_or(-2, |e| e.ttl)),
        other => RespValue::Error(format!("ERR unknown command '{}'", other)),
    };
    Some(reply)
}

async fn memcache_reply(reader: &mut BufReader<OwnedReadHalf>, shared: &Shared, line: &str) -> io::Result<Bytes> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let cmd = parts.first().copied().unwrap_or_default();
    shared.commands.lock().push(cmd.to_uppercase());

    let reply = match cmd {
        "get" | "gets" => {
            let data = shared.data.lock();
            let mut out = BytesMut::new();
            for key in &parts[1..] {
                if let Some(entry) = data.get(*key).filter(|e| e.is_live()) {
                    let header = if cmd == "gets" {
                        format!("VALUE {} {} {} {}\r\n", key, entry.flags, entry.value.len(), entry.cas)
                    } else {
                        format!("VALUE {} {} {}\r\n", key, entry.flags, entry.value.len())
                    };
                    out.extend_from_slice(header.as_bytes());
                    out.extend_from_slice(&entry.value);
                    out.extend_from_slice(b"\r\n");
                }
            }
            out.extend_from_slice(b"END\r\n");
            return Ok(out.freeze());
        }
        "set" | "add" | "replace" | "append" | "prepend" | "cas" => {
            let key = parts.get(1).copied().unwrap_or_default().to_string();
            let flags: u32 = parts.get(2).and_then(|f| f.parse().ok()).unwrap_or(0);
            let ttl: i64 = parts.get(3).and_then(|f| f.parse().ok()).unwrap_or(0);
            let len: usize = parts.get(4).and_then(|f| f.parse().ok()).unwrap_or(0);
            let cas_id: u64 = parts.get(5).and_then(|f| f.parse().ok()).unwrap_or(0);
            let value = read_block(reader, len).await?;
            memcache_store(shared, cmd, key, value, flags, ttl, cas_id)
        }
        "delete" => match shared.data.lock().remove(parts.get(1).copied().unwrap_or_default()) {
            Some(_) => "DELETED".to_string(),
            None => "NOT_FOUND".to_string(),
        },
        "incr" | "decr" => {
            let key = parts.get(1).copied().unwrap_or_default();
            let delta: u64 = parts.get(2).and_then(|d| d.parse().ok()).unwrap_or(0);
            let mut data = shared.data.lock();
            match data.get_mut(key) {
                None => "NOT_FOUND".to_string(),
                Some(entry) => match text(&entry.value).parse::<u64>() {
                    Err(_) => "CLIENT_ERROR cannot increment or decrement non-numeric value".to_string(),
                    Ok(current) => {
                        let value = if cmd == "incr" {
                            current.wrapping_add(delta)
                        } else {
                            current.saturating_sub(delta)
                        };
                        entry.value = Bytes::from(value.to_string());
                        value.to_string()
                    }
                },
            }
        }
        "touch" => {
            let ttl: i64 = parts.get(2).and_then(|t| t.parse().ok()).unwrap_or(0);
            match shared.data.lock().get_mut(parts.get(1).copied().unwrap_or_default()) {
                Some(entry) => {
                    entry.ttl = ttl;
                    entry.stored = Instant::now();
                    "TOUCHED".to_string()
                }
                None => "NOT_FOUND".to_string(),
            }
        }
        "stats" => {
            let items = shared.data.lock().len();
            format!(
                "STAT pid 4242\r\nSTAT version 1.6.21\r\nSTAT curr_items {}\r\nSTAT engine fake memcache\r\nEND",
                items
            )
        }
        "flush_all" => {
            shared.data.lock().clear();
            "OK".to_string()
        }
        "version" => "VERSION 1.6.21".to_string(),
        _ => "ERROR".to_string(),
    };

    Ok(Bytes::from(format!("{}\r\n", reply)))
}

fn memcache_store(shared: &Shared, cmd: &str, key: String, value: Bytes, flags: u32, ttl: i64, cas_id: u64) -> String {
    if key.ends_with(SERVER_ERROR_KEY) {
        return "SERVER_ERROR out of memory storing object".to_string();
    }

    let mut data = shared.data.lock();
    let existing = data.get(&key).cloned();
    let (value, flags) = match (cmd, &existing) {
        ("add", Some(_)) => return "NOT_STORED".to_string(),
        ("replace" | "append" | "prepend", None) => return "NOT_STORED".to_string(),
        ("cas", None) => return "NOT_FOUND".to_string(),
        ("cas", Some(entry)) if entry.cas != cas_id => return "EXISTS".to_string(),
        ("append", Some(entry)) => ([entry.value.as_ref(), value.as_ref()].concat().into(), entry.flags),
        ("prepend", Some(entry)) => ([value.as_ref(), entry.value.as_ref()].concat().into(), entry.flags),
        _ => (value, flags),
    };

    let cas = shared.next_cas();
    data.insert(
        key,
        Entry {
            value,
            flags,
            cas,
            ttl,
            stored: Instant::now(),
        },
    );
    "STORED".to_string()
}
