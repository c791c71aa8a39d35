/// Memcache text protocol
///
/// Every function writes one request, flushes it and reads the complete
/// response. A status line that is not one of the documented answers marks
/// the connection down, since the stream position is unknown afterwards.
use crate::core::connection::{Conn, LINE_ENDING};
use crate::error::{CacheError, CacheResult};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;

const MAX_KEY_LEN: usize = 250;

/// Storage commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreCommand {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    /// Store only if the item was not modified since it was fetched with `gets`
    Cas,
}

impl StoreCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreCommand::Set => "set",
            StoreCommand::Add => "add",
            StoreCommand::Replace => "replace",
            StoreCommand::Append => "append",
            StoreCommand::Prepend => "prepend",
            StoreCommand::Cas => "cas",
        }
    }
}

impl fmt::Display for StoreCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retrieval commands, `gets` also returns the cas id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrieveCommand {
    Get,
    Gets,
}

impl RetrieveCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            RetrieveCommand::Get => "get",
            RetrieveCommand::Gets => "gets",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: String,
    pub data: Bytes,
    pub flags: u32,
    pub cas_id: u64,
}

impl Item {
    pub fn new(key: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            data: data.into(),
            flags: 0,
            cas_id: 0,
        }
    }
}

/// Keys are at most 250 bytes without whitespace or control characters
pub fn validate_key(key: &str) -> CacheResult<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(CacheError::invalid_command(format!("invalid key length: {}", key.len())));
    }
    if key.bytes().any(|b| b <= b' ' || b == 0x7f) {
        return Err(CacheError::invalid_command(format!("invalid key: {:?}", key)));
    }
    Ok(())
}

async fn request(conn: &mut Conn, line: &str) -> CacheResult<()> {
    let mut buf = BytesMut::with_capacity(line.len() + 2);
    buf.extend_from_slice(line.as_bytes());
    buf.put_slice(LINE_ENDING);
    conn.send(&buf).await
}

fn unexpected(conn: &mut Conn, line: &[u8]) -> CacheError {
    conn.corrupted(format!("unexpected response: {}", String::from_utf8_lossy(line)))
}

/// `STORED` is true, `NOT_STORED`, `EXISTS` and `NOT_FOUND` are false
pub async fn store(conn: &mut Conn, cmd: StoreCommand, item: &Item, expire: u64) -> CacheResult<bool> {
    validate_key(&item.key)?;

    let header = match cmd {
        StoreCommand::Cas => format!(
            "{} {} {} {} {} {}",
            cmd,
            item.key,
            item.flags,
            expire,
            item.data.len(),
            item.cas_id
        ),
        _ => format!("{} {} {} {} {}", cmd, item.key, item.flags, expire, item.data.len()),
    };

    let mut buf = BytesMut::with_capacity(header.len() + item.data.len() + 4);
    buf.extend_from_slice(header.as_bytes());
    buf.put_slice(LINE_ENDING);
    buf.extend_from_slice(&item.data);
    buf.put_slice(LINE_ENDING);
    conn.send(&buf).await?;

    let line = conn.read_line().await?;
    match line.as_slice() {
        b"STORED" => Ok(true),
        b"NOT_STORED" | b"EXISTS" | b"NOT_FOUND" => Ok(false),
        other => Err(unexpected(conn, other)),
    }
}

/// Items for the keys that exist; missing keys are simply absent
pub async fn retrieve<K: AsRef<str>>(conn: &mut Conn, cmd: RetrieveCommand, keys: &[K]) -> CacheResult<Vec<Item>> {
    if keys.is_empty() {
        return Err(CacheError::invalid_command("retrieve needs at least one key"));
    }

    let mut line = String::from(cmd.as_str());
    for key in keys {
        validate_key(key.as_ref())?;
        line.push(' ');
        line.push_str(key.as_ref());
    }
    request(conn, &line).await?;

    let mut items = Vec::new();
    loop {
        let line = conn.read_line().await?;
        if line == b"END" {
            return Ok(items);
        }

        let Some((mut item, size)) = parse_value_line(&line, cmd) else {
            return Err(unexpected(conn, &line));
        };
        item.data = conn.read_payload(size).await?;
        items.push(item);
    }
}

fn parse_value_line(line: &[u8], cmd: RetrieveCommand) -> Option<(Item, usize)> {
    let line = std::str::from_utf8(line).ok()?;
    let mut parts = line.split(' ');
    if parts.next()? != "VALUE" {
        return None;
    }

    let key = parts.next()?.to_string();
    let flags = parts.next()?.parse().ok()?;
    let size = parts.next()?.parse().ok()?;
    let cas_id = match cmd {
        RetrieveCommand::Gets => parts.next()?.parse().ok()?,
        RetrieveCommand::Get => 0,
    };

    Some((
        Item {
            key,
            data: Bytes::new(),
            flags,
            cas_id,
        },
        size,
    ))
}

/// `DELETED` is true, `NOT_FOUND` is false
pub async fn delete(conn: &mut Conn, key: &str) -> CacheResult<bool> {
    validate_key(key)?;
    request(conn, &format!("delete {}", key)).await?;

    let line = conn.read_line().await?;
    match line.as_slice() {
        b"DELETED" => Ok(true),
        b"NOT_FOUND" => Ok(false),
        other => Err(unexpected(conn, other)),
    }
}

/// `incr` for a positive delta, `decr` otherwise; a missing key is seeded
/// with `max(delta, 0)`. The server floors decrements at zero.
pub async fn increment(conn: &mut Conn, key: &str, delta: i64) -> CacheResult<u64> {
    validate_key(key)?;
    let line = if delta > 0 {
        format!("incr {} {}", key, delta)
    } else {
        format!("decr {} {}", key, delta.unsigned_abs())
    };
    request(conn, &line).await?;

    let line = conn.read_line().await?;
    if line == b"NOT_FOUND" {
        let seed = delta.max(0) as u64;
        store(conn, StoreCommand::Set, &Item::new(key, seed.to_string()), 0).await?;
        return Ok(seed);
    }

    match btoi::btou(&line) {
        Ok(value) => Ok(value),
        Err(_) => Err(unexpected(conn, &line)),
    }
}

/// `TOUCHED` is true, `NOT_FOUND` is false
pub async fn touch(conn: &mut Conn, key: &str, expire: u64) -> CacheResult<bool> {
    validate_key(key)?;
    request(conn, &format!("touch {} {}", key, expire)).await?;

    let line = conn.read_line().await?;
    match line.as_slice() {
        b"TOUCHED" => Ok(true),
        b"NOT_FOUND" => Ok(false),
        other => Err(unexpected(conn, other)),
    }
}

/// Server statistics; `args` selects a group such as `items` or `slabs`
pub async fn stats(conn: &mut Conn, args: &[&str]) -> CacheResult<HashMap<String, String>> {
    let mut line = String::from("stats");
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    request(conn, &line).await?;

    let mut stats = HashMap::new();
    loop {
        let line = conn.read_line().await?;
        if line == b"END" {
            return Ok(stats);
        }

        let text = String::from_utf8_lossy(&line);
        let mut parts = text.splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("STAT"), Some(name), value) => {
                stats.insert(name.to_string(), value.unwrap_or_default().to_string());
            }
            _ => return Err(unexpected(conn, &line)),
        }
    }
}

pub async fn flush_all(conn: &mut Conn) -> CacheResult<bool> {
    request(conn, "flush_all").await?;

    let line = conn.read_line().await?;
    match line.as_slice() {
        b"OK" => Ok(true),
        other => Err(unexpected(conn, other)),
    }
}

pub async fn version(conn: &mut Conn) -> CacheResult<String> {
    request(conn, "version").await?;

    let line = conn.read_line().await?;
    match line.strip_prefix(b"VERSION ") {
        Some(version) if !version.is_empty() => Ok(String::from_utf8_lossy(version).into_owned()),
        _ => Err(unexpected(conn, &line)),
    }
}
