//! Device transport streams and the connector that opens them.

use crate::config::{DeviceConfig, DEFAULT_BAUD_RATE};
use crate::error::ClientError;
use async_trait::async_trait;
use pin_project_lite::pin_project;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use wristlink_protocol::TransportMode;

pin_project! {
    /// A device stream: the emulator's TCP pipe or a serial device node.
    ///
    /// Both variants are readiness based, so a read dropped by `select!`
    /// loses no bytes and never blocks a following write.
    #[project = DeviceStreamProj]
    pub enum DeviceStream {
        Tcp { #[pin] stream: TcpStream },
        Serial { #[pin] port: SerialStream },
    }
}

impl fmt::Debug for DeviceStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStream::Tcp { stream } => f
                .debug_struct("Tcp")
                .field("peer", &stream.peer_addr().ok())
                .finish(),
            DeviceStream::Serial { .. } => f.debug_struct("Serial").finish_non_exhaustive(),
        }
    }
}

impl DeviceStream {
    pub fn is_tcp(&self) -> bool {
        matches!(self, DeviceStream::Tcp { .. })
    }
}

impl AsyncRead for DeviceStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            DeviceStreamProj::Tcp { stream } => stream.poll_read(cx, buf),
            DeviceStreamProj::Serial { port } => port.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DeviceStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            DeviceStreamProj::Tcp { stream } => stream.poll_write(cx, buf),
            DeviceStreamProj::Serial { port } => port.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            DeviceStreamProj::Tcp { stream } => stream.poll_flush(cx),
            DeviceStreamProj::Serial { port } => port.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            DeviceStreamProj::Tcp { stream } => stream.poll_shutdown(cx),
            DeviceStreamProj::Serial { port } => port.poll_shutdown(cx),
        }
    }
}

/// Opens a fresh transport for every (re)connect.
#[async_trait]
pub trait Connector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    async fn connect(&self) -> Result<Self::Stream, ClientError>;

    /// Framing used on streams from this connector.
    fn mode(&self) -> TransportMode;

    /// Human-readable target for logs.
    fn describe(&self) -> String;
}

/// Where a [`DeviceConnector`] connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceTarget {
    Tcp(String),
    Serial(PathBuf),
}

/// Connects to the device named in the configuration.
#[derive(Debug, Clone)]
pub struct DeviceConnector {
    target: DeviceTarget,
    mode: TransportMode,
    baud_rate: u32,
}

impl DeviceConnector {
    pub fn new(target: DeviceTarget, mode: TransportMode) -> Self {
        Self {
            target,
            mode,
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn from_config(config: &DeviceConfig) -> Self {
        let mode = config.transport_mode();
        let target = match mode {
            TransportMode::Emulator => DeviceTarget::Tcp(config.address.clone()),
            TransportMode::Serial => DeviceTarget::Serial(PathBuf::from(&config.address)),
        };
        Self::new(target, mode).with_baud_rate(config.baud_rate)
    }

    pub fn target(&self) -> &DeviceTarget {
        &self.target
    }
}

#[async_trait]
impl Connector for DeviceConnector {
    type Stream = DeviceStream;

    async fn connect(&self) -> Result<DeviceStream, ClientError> {
        match &self.target {
            DeviceTarget::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true).ok();
                Ok(DeviceStream::Tcp { stream })
            }
            DeviceTarget::Serial(path) => {
                let port = tokio_serial::new(path.to_string_lossy(), self.baud_rate)
                    .open_native_async()
                    .map_err(io::Error::from)?;
                Ok(DeviceStream::Serial { port })
            }
        }
    }

    fn mode(&self) -> TransportMode {
        self.mode
    }

    fn describe(&self) -> String {
        match &self.target {
            DeviceTarget::Tcp(addr) => format!("tcp://{}", addr),
            DeviceTarget::Serial(path) => path.display().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_connector_from_config() {
        let connector = DeviceConnector::from_config(&DeviceConfig::default());
        assert_eq!(connector.mode(), TransportMode::Emulator);
        assert_eq!(
            connector.target(),
            &DeviceTarget::Tcp("127.0.0.1:12344".to_string())
        );

        let connector = DeviceConnector::from_config(&DeviceConfig {
            address: "/dev/rfcomm0".to_string(),
            transport: TransportKind::Auto,
            baud_rate: 9600,
        });
        assert_eq!(connector.mode(), TransportMode::Serial);
        assert_eq!(connector.describe(), "/dev/rfcomm0");
    }

    #[tokio::test]
    async fn test_tcp_stream_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let connector =
            DeviceConnector::new(DeviceTarget::Tcp(addr.to_string()), TransportMode::Emulator);
        let mut stream = connector.connect().await.unwrap();
        assert!(stream.is_tcp());
        assert!(format!("{:?}", stream).starts_with("Tcp"));
        stream.write_all(&[1, 2, 3, 4]).await.unwrap();
        let mut echoed = [0u8; 4];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, [1, 2, 3, 4]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_serial_device() {
        let connector = DeviceConnector::new(
            DeviceTarget::Serial(PathBuf::from("/nonexistent/rfcomm9")),
            TransportMode::Serial,
        );
        let err = connector.connect().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_serial_read_survives_cancellation() {
        let (phone, mut watch) = SerialStream::pair().unwrap();
        let (mut reader, mut writer) = tokio::io::split(DeviceStream::Serial { port: phone });
        let mut buf = [0u8; 6];

        // Nothing sent yet; the read is dropped like a losing select! branch.
        let idle = tokio::time::timeout(Duration::from_millis(50), reader.read(&mut buf)).await;
        assert!(idle.is_err());

        watch.write_all(b"DEVICE").await.unwrap();
        writer.write_all(b"PHONE").await.unwrap();
        writer.flush().await.unwrap();

        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"DEVICE");
        let mut received = [0u8; 5];
        watch.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"PHONE");
    }
}
