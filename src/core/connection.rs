/// Persistent backend connection
///
/// A `Conn` owns one socket (TCP, or a Unix domain socket when the address
/// contains a path separator) behind a buffered reader/writer. Every read
/// and write is bounded by an absolute deadline that callers extend before
/// use. Any I/O error, timeout or protocol corruption marks the connection
/// down so the pool closes it instead of recycling it.
use crate::core::pool::Handle;
use crate::error::{CacheError, CacheResult};
use crate::utils::is_unix_addr;
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, warn};

/// Byte stream a connection can run over
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

pub const LINE_ENDING: &[u8] = b"\r\n";
/// Largest payload accepted from a server, the Redis bulk string limit
pub const MAX_PAYLOAD_SIZE: usize = 512 * 1024 * 1024;

pub struct Conn {
    addr: Arc<str>,
    stream: BufStream<BoxedStream>,
    net_timeout: Duration,
    deadline: Instant,
    last_active: Instant,
    down: bool,
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("addr", &self.addr)
            .field("down", &self.down)
            .field("idle", &self.last_active.elapsed())
            .finish()
    }
}

impl Conn {
    /// Dial `addr` within `net_timeout`
    pub async fn connect(addr: &str, net_timeout: Duration) -> CacheResult<Self> {
        let stream = dial_stream(addr, net_timeout).await?;
        Ok(Self::from_stream(addr, stream, net_timeout))
    }

    /// Wrap an already connected stream
    pub fn from_stream(addr: &str, stream: BoxedStream, net_timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            addr: Arc::from(addr),
            stream: BufStream::new(stream),
            net_timeout,
            deadline: now + net_timeout,
            last_active: now,
            down: false,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_down(&self) -> bool {
        self.down
    }

    pub fn mark_down(&mut self) {
        self.down = true;
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.elapsed()
    }

    /// Stamp the connection as just used
    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    /// Push the deadline `net_timeout` into the future
    pub fn extend_deadline(&mut self) {
        self.extend_deadline_by(self.net_timeout);
    }

    pub fn extend_deadline_by(&mut self, duration: Duration) {
        self.deadline = Instant::now() + duration;
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Mark the connection down and build a protocol error
    pub fn corrupted<S: Into<String>>(&mut self, message: S) -> CacheError {
        self.down = true;
        CacheError::protocol(message)
    }

    /// Buffer bytes without flushing
    pub async fn write(&mut self, buf: &[u8]) -> CacheResult<()> {
        let deadline = self.deadline;
        let result = bounded(deadline, "write request", self.stream.write_all(buf)).await;
        self.check(result)
    }

    pub async fn flush(&mut self) -> CacheResult<()> {
        let deadline = self.deadline;
        let result = bounded(deadline, "send request", self.stream.flush()).await;
        self.check(result)
    }

    /// Write and flush in one step
    pub async fn send(&mut self, buf: &[u8]) -> CacheResult<()> {
        self.write(buf).await?;
        self.flush().await
    }

    /// Read one `\r\n` terminated line, returned without the terminator
    pub async fn read_line(&mut self) -> CacheResult<Vec<u8>> {
        let deadline = self.deadline;
        let mut line = Vec::with_capacity(64);
        let result = bounded(deadline, "read response", self.stream.read_until(b'\n', &mut line)).await;
        let read = self.check(result)?;

        if read == 0 {
            self.down = true;
            return Err(CacheError::Connection(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            )));
        }

        if !line.ends_with(LINE_ENDING) {
            return Err(self.corrupted("unexpected line ending"));
        }

        line.truncate(line.len() - LINE_ENDING.len());
        Ok(line)
    }

    /// Read a `size` byte payload followed by `\r\n`
    pub async fn read_payload(&mut self, size: usize) -> CacheResult<Bytes> {
        if size > MAX_PAYLOAD_SIZE {
            return Err(self.corrupted(format!("payload of {} bytes exceeds limit", size)));
        }
        let Some(total) = size.checked_add(LINE_ENDING.len()) else {
            return Err(self.corrupted(format!("invalid payload size {}", size)));
        };

        let deadline = self.deadline;
        let mut data = vec![0u8; total];
        let result = bounded(deadline, "read payload", self.stream.read_exact(&mut data)).await;
        self.check(result)?;

        if !data.ends_with(LINE_ENDING) {
            return Err(self.corrupted("payload not terminated by CRLF"));
        }

        data.truncate(size);
        Ok(Bytes::from(data))
    }

    fn check<T>(&mut self, result: CacheResult<T>) -> CacheResult<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                debug!("connection to {} marked down: {}", self.addr, e);
                self.down = true;
            }
        }
        result
    }
}

impl Handle for Conn {
    fn addr(&self) -> &str {
        &self.addr
    }

    fn is_down(&self) -> bool {
        self.down
    }

    fn idle_for(&self) -> Duration {
        self.last_active.elapsed()
    }

    fn lend(&mut self) {
        self.extend_deadline();
    }

    fn park(&mut self) {
        self.touch();
    }
}

async fn bounded<T, F>(deadline: Instant, operation: &str, fut: F) -> CacheResult<T>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout_at(deadline, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(CacheError::Connection(e)),
        Err(_) => Err(CacheError::timeout(operation)),
    }
}

/// Open a raw stream to `addr`, TCP unless the address is a socket path
pub async fn dial_stream(addr: &str, net_timeout: Duration) -> CacheResult<BoxedStream> {
    if is_unix_addr(addr) {
        return dial_unix(addr, net_timeout).await;
    }

    let stream = match timeout(net_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(CacheError::Connection(e)),
        Err(_) => return Err(CacheError::timeout(format!("connect to {}", addr))),
    };

    if let Err(e) = configure_tcp_stream(&stream) {
        warn!("Failed to configure stream to {}: {}", addr, e);
    }

    Ok(Box::new(stream))
}

fn configure_tcp_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    socket2::SockRef::from(stream).set_keepalive(true)?;
    Ok(())
}

#[cfg(unix)]
async fn dial_unix(addr: &str, net_timeout: Duration) -> CacheResult<BoxedStream> {
    match timeout(net_timeout, tokio::net::UnixStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(Box::new(stream)),
        Ok(Err(e)) => Err(CacheError::Connection(e)),
        Err(_) => Err(CacheError::timeout(format!("connect to {}", addr))),
    }
}

#[cfg(not(unix))]
async fn dial_unix(addr: &str, _net_timeout: Duration) -> CacheResult<BoxedStream> {
    Err(CacheError::Connection(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("unix sockets are not supported: {}", addr),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    fn pipe() -> (Conn, tokio::io::DuplexStream) {
        let (client, server) = duplex(64 * 1024);
        let conn = Conn::from_stream("test:0", Box::new(client), Duration::from_millis(200));
        (conn, server)
    }

    #[tokio::test]
    async fn test_read_line_and_payload() {
        let (mut conn, mut server) = pipe();
        server.write_all(b"+OK\r\n$5\r\nhello\r\n").await.unwrap();

        assert_eq!(conn.read_line().await.unwrap(), b"+OK".to_vec());
        assert_eq!(conn.read_line().await.unwrap(), b"$5".to_vec());
        assert_eq!(conn.read_payload(5).await.unwrap(), Bytes::from("hello"));
        assert!(!conn.is_down());
    }

    #[tokio::test]
    async fn test_oversized_payload_marks_down() {
        let (mut conn, _server) = pipe();

        let err = conn.read_payload(usize::MAX).await.unwrap_err();
        assert!(matches!(err, CacheError::Protocol(_)));
        assert!(conn.is_down());
    }

    #[tokio::test]
    async fn test_bad_line_ending_marks_down() {
        let (mut conn, mut server) = pipe();
        server.write_all(b"+OK\n").await.unwrap();

        let err = conn.read_line().await.unwrap_err();
        assert!(matches!(err, CacheError::Protocol(_)));
        assert!(conn.is_down());
    }

    #[tokio::test]
    async fn test_deadline_marks_down() {
        let (mut conn, _server) = pipe();
        conn.extend_deadline_by(Duration::from_millis(20));

        let err = conn.read_line().await.unwrap_err();
        assert!(matches!(err, CacheError::Timeout { .. }));
        assert!(conn.is_down());
    }

    #[tokio::test]
    async fn test_peer_close_marks_down() {
        let (mut conn, server) = pipe();
        drop(server);

        let err = conn.read_line().await.unwrap_err();
        assert!(matches!(err, CacheError::Connection(_)));
        assert!(conn.is_down());
    }

    #[tokio::test]
    async fn test_send_reaches_peer() {
        let (mut conn, mut server) = pipe();
        conn.write(b"version").await.unwrap();
        conn.write(LINE_ENDING).await.unwrap();
        conn.flush().await.unwrap();

        let mut buf = [0u8; 9];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"version\r\n");
    }

    #[tokio::test]
    async fn test_connect_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let conn = Conn::connect(&addr, Duration::from_secs(1)).await.unwrap();
        assert_eq!(conn.addr(), addr);
        assert!(conn.idle_for() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = Conn::connect(&addr, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(CacheError::Connection(_))));
    }
}
