//! Line-oriented transports for ASCII instruments.
//!
//! Both the pump (plain serial commands) and the SMU (SCPI) speak
//! newline-terminated text. [`LineTransport`] wraps any
//! `AsyncRead + AsyncWrite` stream with a buffered reader, a command
//! terminator and a bounded read timeout:
//!
//! - `tokio_serial::SerialStream` (real RS-232/USB-serial hardware)
//! - `tokio::net::TcpStream` (SCPI raw socket, port 5025)
//! - `tokio::io::DuplexStream` (tests)
//!
//! Errors stay as `std::io::Error` here; drivers classify them.

use crate::hardware::connection::Connector;
use crate::limits::DEVICE_IO_TIMEOUT;
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

/// Any async byte stream usable as an instrument port.
pub trait PortIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> PortIo for T {}

/// Type-erased transport handle stored by pump and SMU links.
pub type DynTransport = Box<dyn Transport>;

/// Command/response channel to an ASCII instrument.
#[async_trait]
pub trait Transport: Send {
    /// Send one command; the terminator is appended.
    async fn write_line(&mut self, command: &str) -> io::Result<()>;

    /// Send one command and read one reply line (trimmed).
    async fn query(&mut self, command: &str) -> io::Result<String>;

    /// Human-readable endpoint description.
    fn describe(&self) -> String;
}

/// Buffered, timeout-bounded line transport over any stream.
pub struct LineTransport<S: PortIo> {
    port: BufReader<S>,
    terminator: String,
    timeout: Duration,
    label: String,
}

impl<S: PortIo> LineTransport<S> {
    /// Wrap a stream with CRLF terminators and the default I/O timeout.
    pub fn new(stream: S, label: impl Into<String>) -> Self {
        Self {
            port: BufReader::new(stream),
            terminator: "\r\n".to_string(),
            timeout: DEVICE_IO_TIMEOUT,
            label: label.into(),
        }
    }

    /// Set the command terminator.
    pub fn with_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.terminator = terminator.into();
        self
    }

    /// Set the bound on each write and each reply.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn send(&mut self, command: &str) -> io::Result<()> {
        let frame = format!("{}{}", command, self.terminator);
        let stream = self.port.get_mut();
        tokio::time::timeout(self.timeout, async {
            stream.write_all(frame.as_bytes()).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("write of '{command}' timed out")))?
    }
}

#[async_trait]
impl<S: PortIo> Transport for LineTransport<S> {
    async fn write_line(&mut self, command: &str) -> io::Result<()> {
        debug!(port = %self.label, command, "->");
        self.send(command).await
    }

    async fn query(&mut self, command: &str) -> io::Result<String> {
        debug!(port = %self.label, command, "-> (query)");
        self.send(command).await?;

        let mut reply = String::new();
        let read = tokio::time::timeout(self.timeout, self.port.read_line(&mut reply))
            .await
            .map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, format!("no reply to '{command}'"))
            })??;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("port closed while waiting for reply to '{command}'"),
            ));
        }
        let reply = reply.trim().to_string();
        debug!(port = %self.label, reply = %reply, "<-");
        Ok(reply)
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// Where an instrument can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Raw TCP socket, e.g. `tcp://192.168.0.20:5025`.
    Tcp {
        /// `host:port`
        address: String,
    },
    /// Serial port, e.g. `serial://COM3?baud=9600`.
    Serial {
        /// Port name or device path.
        port: String,
        /// Baud rate.
        baud_rate: u32,
    },
}

impl Endpoint {
    /// Parse an endpoint string. A bare port name is treated as serial at
    /// `default_baud`.
    pub fn parse(resource: &str, default_baud: u32) -> Result<Self, String> {
        let resource = resource.trim();
        if resource.is_empty() {
            return Err("empty resource string".into());
        }
        if let Some(address) = resource.strip_prefix("tcp://") {
            if !address.contains(':') {
                return Err(format!("TCP resource '{resource}' needs host:port"));
            }
            return Ok(Endpoint::Tcp {
                address: address.to_string(),
            });
        }
        let rest = resource.strip_prefix("serial://").unwrap_or(resource);
        let (port, query) = match rest.split_once('?') {
            Some((port, query)) => (port, Some(query)),
            None => (rest, None),
        };
        let mut baud_rate = default_baud;
        if let Some(query) = query {
            for pair in query.split('&') {
                if let Some(value) = pair.strip_prefix("baud=") {
                    baud_rate = value
                        .parse()
                        .map_err(|_| format!("invalid baud rate '{value}'"))?;
                }
            }
        }
        if port.is_empty() {
            return Err(format!("serial resource '{resource}' has no port"));
        }
        Ok(Endpoint::Serial {
            port: port.to_string(),
            baud_rate,
        })
    }

    /// Build the connector that opens this endpoint.
    pub fn connector(&self, timeout: Duration) -> std::sync::Arc<dyn Connector<DynTransport>> {
        match self {
            Endpoint::Tcp { address } => std::sync::Arc::new(TcpConnector {
                address: address.clone(),
                timeout,
            }),
            Endpoint::Serial { port, baud_rate } => std::sync::Arc::new(SerialConnector {
                port: port.clone(),
                baud_rate: *baud_rate,
                timeout,
            }),
        }
    }
}

/// Opens a raw SCPI socket.
pub struct TcpConnector {
    /// `host:port`
    pub address: String,
    /// Connect and I/O timeout.
    pub timeout: Duration,
}

#[async_trait]
impl Connector<DynTransport> for TcpConnector {
    async fn open(&self) -> io::Result<DynTransport> {
        let stream = tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(&self.address))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TCP connect timed out"))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(
            LineTransport::new(stream, self.describe())
                .with_terminator("\n")
                .with_timeout(self.timeout),
        ))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

/// Opens a serial port (8N1, no flow control).
pub struct SerialConnector {
    /// Port name or path.
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// I/O timeout.
    pub timeout: Duration,
}

#[async_trait]
impl Connector<DynTransport> for SerialConnector {
    #[cfg(feature = "instrument_serial")]
    async fn open(&self) -> io::Result<DynTransport> {
        use tokio_serial::SerialPortBuilderExt;

        let port = self.port.clone();
        let baud = self.baud_rate;
        let stream = tokio::task::spawn_blocking(move || {
            tokio_serial::new(&port, baud)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("spawn_blocking failed: {e}")))?
        .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e.to_string()))?;

        Ok(Box::new(
            LineTransport::new(stream, self.describe()).with_timeout(self.timeout),
        ))
    }

    #[cfg(not(feature = "instrument_serial"))]
    async fn open(&self) -> io::Result<DynTransport> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "serial support not enabled. Rebuild with --features instrument_serial",
        ))
    }

    fn describe(&self) -> String {
        format!("serial://{}?baud={}", self.port, self.baud_rate)
    }
}

/// Serial ports currently visible to the OS.
#[cfg(feature = "instrument_serial")]
pub fn available_ports() -> Vec<String> {
    serialport::available_ports()
        .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
        .unwrap_or_default()
}

/// Serial ports currently visible to the OS.
#[cfg(not(feature = "instrument_serial"))]
pub fn available_ports() -> Vec<String> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn query_round_trips_over_duplex() {
        let (host, mut device) = tokio::io::duplex(256);
        let mut transport = LineTransport::new(host, "duplex");

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let n = device.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"*IDN?\r\n");
            device.write_all(b"KEITHLEY INSTRUMENTS,MODEL 2450\n").await.unwrap();
            device
        });

        let reply = transport.query("*IDN?").await.unwrap();
        assert_eq!(reply, "KEITHLEY INSTRUMENTS,MODEL 2450");
        responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_times_out() {
        let (host, _device) = tokio::io::duplex(256);
        let mut transport =
            LineTransport::new(host, "duplex").with_timeout(Duration::from_millis(200));
        let err = transport.query("GET_STATUS").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn closed_port_reports_eof() {
        let (host, device) = tokio::io::duplex(256);
        drop(device);
        let mut transport = LineTransport::new(host, "duplex");
        assert!(transport.query("GET_STATUS").await.is_err());
    }

    #[test]
    fn endpoints_parse() {
        assert_eq!(
            Endpoint::parse("tcp://10.0.0.5:5025", 9600).unwrap(),
            Endpoint::Tcp {
                address: "10.0.0.5:5025".into()
            }
        );
        assert_eq!(
            Endpoint::parse("serial://COM3?baud=19200", 9600).unwrap(),
            Endpoint::Serial {
                port: "COM3".into(),
                baud_rate: 19200
            }
        );
        assert_eq!(
            Endpoint::parse("/dev/ttyUSB0", 9600).unwrap(),
            Endpoint::Serial {
                port: "/dev/ttyUSB0".into(),
                baud_rate: 9600
            }
        );
        assert!(Endpoint::parse("tcp://nohost", 9600).is_err());
        assert!(Endpoint::parse("", 9600).is_err());
    }
}
