/// Redis RESP (Redis Serialization Protocol) encoding and reply decoding
use crate::core::connection::{Conn, LINE_ENDING, MAX_PAYLOAD_SIZE};
use crate::core::value::Encode;
use crate::error::{CacheError, CacheResult};
use bytes::{BufMut, Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::FutureExt;

/// RESP data types
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple String (+OK\r\n)
    SimpleString(String),
    /// Error (-ERR message\r\n), only kept as a value inside arrays
    Error(String),
    /// Integer (:123\r\n)
    Integer(i64),
    /// Bulk String ($5\r\nhello\r\n)
    BulkString(Option<Bytes>), // None represents NULL
    /// Array (*2\r\n$5\r\nhello\r\n$5\r\nworld\r\n)
    Array(Option<Vec<RespValue>>), // None represents NULL array
}

impl RespValue {
    pub fn is_nil(&self) -> bool {
        matches!(self, RespValue::BulkString(None) | RespValue::Array(None))
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, RespValue::SimpleString(s) if s == "OK")
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            RespValue::BulkString(Some(data)) => btoi::btoi(data).ok(),
            _ => None,
        }
    }

    /// Payload of a string reply
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            RespValue::BulkString(data) => data,
            RespValue::SimpleString(s) => Some(Bytes::from(s)),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            RespValue::Array(items) => items,
            _ => None,
        }
    }
}

/// RESP encoder for writing Redis protocol messages
pub struct RespEncoder;

impl RespEncoder {
    /// Encode a RESP value to bytes
    pub fn encode(value: &RespValue) -> Bytes {
        let mut buf = BytesMut::new();
        Self::encode_into(&mut buf, value);
        buf.freeze()
    }

    /// Encode a RESP value into an existing buffer
    pub fn encode_into(buf: &mut BytesMut, value: &RespValue) {
        match value {
            RespValue::SimpleString(s) => {
                buf.put_u8(b'+');
                buf.extend_from_slice(s.as_bytes());
                buf.put_slice(LINE_ENDING);
            }
            RespValue::Error(s) => {
                buf.put_u8(b'-');
                buf.extend_from_slice(s.as_bytes());
                buf.put_slice(LINE_ENDING);
            }
            RespValue::Integer(n) => {
                buf.put_u8(b':');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.put_slice(LINE_ENDING);
            }
            RespValue::BulkString(Some(data)) => Self::put_bulk(buf, data),
            RespValue::BulkString(None) => buf.extend_from_slice(b"$-1\r\n"),
            RespValue::Array(Some(elements)) => {
                Self::put_header(buf, b'*', elements.len());
                for element in elements {
                    Self::encode_into(buf, element);
                }
            }
            RespValue::Array(None) => buf.extend_from_slice(b"*-1\r\n"),
        }
    }

    /// Encode a command as a multi-bulk request, command name first
    pub fn encode_command(buf: &mut BytesMut, cmd: &str, args: &[&dyn Encode]) -> CacheResult<()> {
        let encoded = args
            .iter()
            .map(|arg| arg.encode())
            .collect::<CacheResult<Vec<Bytes>>>()?;

        Self::put_header(buf, b'*', encoded.len() + 1);
        Self::put_bulk(buf, cmd.as_bytes());
        for arg in &encoded {
            Self::put_bulk(buf, arg);
        }
        Ok(())
    }

    fn put_header(buf: &mut BytesMut, sigil: u8, len: usize) {
        buf.put_u8(sigil);
        buf.extend_from_slice(len.to_string().as_bytes());
        buf.put_slice(LINE_ENDING);
    }

    fn put_bulk(buf: &mut BytesMut, data: &[u8]) {
        Self::put_header(buf, b'$', data.len());
        buf.extend_from_slice(data);
        buf.put_slice(LINE_ENDING);
    }
}

/// Buffer a command on `conn` without flushing
pub async fn write_command(conn: &mut Conn, cmd: &str, args: &[&dyn Encode]) -> CacheResult<()> {
    let mut buf = BytesMut::with_capacity(64);
    RespEncoder::encode_command(&mut buf, cmd, args)?;
    conn.write(&buf).await
}

/// Send one command and read its reply
pub async fn call(conn: &mut Conn, cmd: &str, args: &[&dyn Encode]) -> CacheResult<RespValue> {
    write_command(conn, cmd, args).await?;
    conn.flush().await?;
    read_reply(conn).await
}

/// Read one reply; a top level error reply becomes `CacheError::Command`
/// and leaves the connection usable
pub async fn read_reply(conn: &mut Conn) -> CacheResult<RespValue> {
    match read_value(conn).await? {
        RespValue::Error(message) => Err(CacheError::Command(message)),
        value => Ok(value),
    }
}

const MAX_ARRAY_PREALLOC: i64 = 1024;

fn read_value(conn: &mut Conn) -> BoxFuture<'_, CacheResult<RespValue>> {
    async move {
        let line = conn.read_line().await?;
        let Some((&sigil, payload)) = line.split_first() else {
            return Err(conn.corrupted("empty reply line"));
        };

        match sigil {
            b'+' => Ok(RespValue::SimpleString(String::from_utf8_lossy(payload).into_owned())),
            b'-' => Ok(RespValue::Error(String::from_utf8_lossy(payload).into_owned())),
            b':' => parse_int(conn, payload).map(RespValue::Integer),
            b'$' => match parse_int(conn, payload)? {
                size if size < 0 => Ok(RespValue::BulkString(None)),
                size => match usize::try_from(size) {
                    Ok(size) if size <= MAX_PAYLOAD_SIZE => {
                        Ok(RespValue::BulkString(Some(conn.read_payload(size).await?)))
                    }
                    _ => Err(conn.corrupted(format!("bulk string of {} bytes exceeds limit", size))),
                },
            },
            b'*' => match parse_int(conn, payload)? {
                argc if argc < 0 => Ok(RespValue::Array(None)),
                argc => {
                    let mut items = Vec::with_capacity(argc.min(MAX_ARRAY_PREALLOC) as usize);
                    for _ in 0..argc {
                        items.push(read_value(conn).await?);
                    }
                    Ok(RespValue::Array(Some(items)))
                }
            },
            other => Err(conn.corrupted(format!("invalid reply type: {}", other as char))),
        }
    }
    .boxed()
}

fn parse_int(conn: &mut Conn, payload: &[u8]) -> CacheResult<i64> {
    btoi::btoi(payload)
        .map_err(|e| conn.corrupted(format!("invalid integer {:?}: {}", String::from_utf8_lossy(payload), e)))
}
