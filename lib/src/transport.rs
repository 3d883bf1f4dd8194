//! Serial and TCP byte transports behind a single type.
//!
//! Both variants share the same contract: reads return within a 500 ms
//! budget (zero bytes meaning "nothing arrived"), end-of-stream and write
//! failures close the transport, and the caller reopens it. The connection
//! string picks the variant: `tcp://host:port` is TCP, anything else is a
//! serial device path.

use std::fmt;
use std::io::ErrorKind;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::framer::ByteSource;

pub const DEFAULT_BAUD: u32 = 57600;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_BUDGET: Duration = Duration::from_millis(500);
const FLUSH_BUDGET: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid connection string {0:?}")]
    BadConnectionString(String),
    #[error("failed to open {target}: {detail}")]
    Open { target: String, detail: String },
    #[error("connecting timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("read failed: {0}")]
    Read(std::io::Error),
    #[error("write failed: {0}")]
    Write(std::io::Error),
    #[error("transport is closed")]
    Closed,
    #[error("end of stream, connection closed by peer")]
    Eof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Serial { path: String, baud: u32 },
    Tcp { host: String, port: u16 },
}

impl Target {
    /// `tcp://host:port` selects TCP; anything else is a serial device path.
    pub fn parse(connection: &str, baud: u32) -> Result<Self, TransportError> {
        let is_tcp = connection.len() >= 6 && connection[..6].eq_ignore_ascii_case("tcp://");
        if !is_tcp {
            return Ok(Target::Serial {
                path: connection.to_string(),
                baud,
            });
        }
        let bad = || TransportError::BadConnectionString(connection.to_string());
        let (host, port) = connection[6..].rsplit_once(':').ok_or_else(bad)?;
        if host.is_empty() {
            return Err(bad());
        }
        let port = port.parse().map_err(|_| bad())?;
        Ok(Target::Tcp {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Serial { path, .. } => write!(f, "{path}"),
            Target::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
        }
    }
}

enum Stream {
    Serial(SerialStream),
    Tcp(TcpStream),
}

impl Stream {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Serial(s) => s.read(buf).await,
            Stream::Tcp(s) => s.read(buf).await,
        }
    }

    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Stream::Serial(s) => {
                s.write_all(bytes).await?;
                s.flush().await
            }
            Stream::Tcp(s) => {
                s.write_all(bytes).await?;
                s.flush().await
            }
        }
    }
}

pub struct Transport {
    target: Target,
    stream: Option<Stream>,
    last_rx: Instant,
}

impl Transport {
    pub fn new(target: Target) -> Self {
        Transport {
            target,
            stream: None,
            last_rx: Instant::now(),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Time since the last byte arrived, the supervisor's liveness input.
    pub fn idle(&self) -> Duration {
        self.last_rx.elapsed()
    }

    pub async fn open(&mut self) -> Result<(), TransportError> {
        match &self.target {
            Target::Serial { path, baud } => {
                let stream = tokio_serial::new(path, *baud)
                    .data_bits(tokio_serial::DataBits::Eight)
                    .parity(tokio_serial::Parity::None)
                    .stop_bits(tokio_serial::StopBits::One)
                    .open_native_async()
                    .map_err(|e| TransportError::Open {
                        target: path.clone(),
                        detail: e.to_string(),
                    })?;
                info!("opened serial port {path} at {baud} baud");
                self.stream = Some(Stream::Serial(stream));
            }
            Target::Tcp { host, port } => {
                let addr = format!("{host}:{port}");
                let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
                    .await
                    .map_err(|_| TransportError::ConnectTimeout(CONNECT_TIMEOUT))?
                    .map_err(|e| TransportError::Open {
                        target: addr.clone(),
                        detail: e.to_string(),
                    })?;
                configure_keepalive(&stream);
                info!("connected to gateway at {addr}");
                self.stream = Some(Stream::Tcp(stream));
            }
        }
        self.last_rx = Instant::now();
        Ok(())
    }

    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            info!("closed connection to {}", self.target);
        }
    }

    /// Read up to `buf.len()` bytes. `Ok(0)` means the read budget elapsed
    /// with nothing available; end of stream closes the transport.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        match timeout(READ_BUDGET, stream.read(buf)).await {
            Err(_) => Ok(0),
            Ok(Ok(0)) => {
                warn!("{} closed by remote end", self.target);
                self.close();
                Err(TransportError::Eof)
            }
            Ok(Ok(n)) => {
                self.last_rx = Instant::now();
                Ok(n)
            }
            Ok(Err(e)) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(0),
            Ok(Err(e)) => {
                self.close();
                Err(TransportError::Read(e))
            }
        }
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        if let Err(e) = stream.write_all(bytes).await {
            self.close();
            return Err(TransportError::Write(e));
        }
        Ok(())
    }

    /// Drain whatever the gateway pushed while nobody was reading, so a
    /// fresh session never starts in the middle of a stale frame.
    pub async fn flush_input(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let mut scratch = [0u8; 256];
        let mut drained = 0usize;
        loop {
            match timeout(FLUSH_BUDGET, stream.read(&mut scratch)).await {
                Ok(Ok(n)) if n > 0 => drained += n,
                _ => break,
            }
        }
        if drained > 0 {
            debug!("flushed {drained} stale bytes from {}", self.target);
        }
    }
}

impl ByteSource for Transport {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.read(buf).await
    }
}

/// Best-effort keepalive tuning so a dead TCP peer is noticed even while
/// the link is radio-silent. Failures are ignored, not every platform has
/// the probe timing knobs.
#[cfg(unix)]
fn configure_keepalive(stream: &TcpStream) {
    use std::os::fd::AsRawFd;

    fn set(fd: i32, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> bool {
        unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                &value as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            ) == 0
        }
    }

    let fd = stream.as_raw_fd();
    if !set(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1) {
        warn!("couldn't enable SO_KEEPALIVE");
        return;
    }
    #[cfg(target_os = "linux")]
    {
        // probe after 60s idle, every 10s, give up after 3 misses
        set(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, 60);
        set(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, 10);
        set(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, 3);
    }
}

#[cfg(not(unix))]
fn configure_keepalive(_stream: &TcpStream) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_parse_serial() {
        let target = Target::parse("/dev/ttyUSB0", DEFAULT_BAUD).unwrap();
        assert_eq!(
            target,
            Target::Serial {
                path: "/dev/ttyUSB0".to_string(),
                baud: 57600
            }
        );
    }

    #[test]
    fn test_target_parse_tcp() {
        let target = Target::parse("tcp://192.168.1.10:2000", DEFAULT_BAUD).unwrap();
        assert_eq!(
            target,
            Target::Tcp {
                host: "192.168.1.10".to_string(),
                port: 2000
            }
        );
        // scheme matching is case-insensitive
        assert!(matches!(
            Target::parse("TCP://gw.local:2000", DEFAULT_BAUD),
            Ok(Target::Tcp { .. })
        ));
    }

    #[test]
    fn test_target_parse_tcp_missing_port() {
        assert!(matches!(
            Target::parse("tcp://192.168.1.10", DEFAULT_BAUD),
            Err(TransportError::BadConnectionString(_))
        ));
        assert!(matches!(
            Target::parse("tcp://:2000", DEFAULT_BAUD),
            Err(TransportError::BadConnectionString(_))
        ));
        assert!(matches!(
            Target::parse("tcp://host:notaport", DEFAULT_BAUD),
            Err(TransportError::BadConnectionString(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_transport_errors() {
        let mut transport =
            Transport::new(Target::parse("tcp://127.0.0.1:9", DEFAULT_BAUD).unwrap());
        assert!(!transport.is_open());
        let mut buf = [0u8; 8];
        assert!(matches!(
            transport.read(&mut buf).await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(
            transport.write_all(&[0x55]).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_tcp_roundtrip_and_eof() {
        use tokio::io::AsyncWriteExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&[0x55, 0x01, 0x02]).await.unwrap();
            // returning drops the socket, the client sees EOF
        });

        let mut transport =
            Transport::new(Target::parse(&format!("tcp://{addr}"), DEFAULT_BAUD).unwrap());
        transport.open().await.unwrap();
        assert!(transport.is_open());

        let mut buf = [0u8; 8];
        let mut received = Vec::new();
        while received.len() < 3 {
            let n = transport.read(&mut buf).await.unwrap();
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, [0x55, 0x01, 0x02]);
        server.await.unwrap();

        // peer is gone now; reads drain to EOF and the transport closes
        loop {
            match transport.read(&mut buf).await {
                Ok(_) => continue,
                Err(TransportError::Eof) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_flush_input_discards_stale_bytes() {
        use tokio::io::AsyncWriteExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&[0xAA; 32]).await.unwrap();
            socket.flush().await.unwrap();
            // keep the socket open past the read budget below
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let mut transport =
            Transport::new(Target::parse(&format!("tcp://{addr}"), DEFAULT_BAUD).unwrap());
        transport.open().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        transport.flush_input().await;

        let mut buf = [0u8; 8];
        assert_eq!(transport.read(&mut buf).await.unwrap(), 0);
        server.abort();
    }
}
