//! LF-terminated ASCII command link shared by the vendor adapters.
//!
//! Both vendor devices answer `*IDN?` with a model string, `CAPS?` with
//! `CAPS <max_channels> <rate>[,<rate>...]`, acknowledge commands with `OK`
//! and report failures as `ERR <message>`.

use crate::hardware::backend::{BackendCapabilities, BackendError};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Byte stream a vendor adapter talks over (serial port, TCP socket, or an
/// in-memory duplex in tests).
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Owned transport.
pub type BoxedTransport = Box<dyn Transport>;

/// Buffered command/response link.
pub struct LineLink {
    stream: BufReader<BoxedTransport>,
    line: String,
}

impl LineLink {
    /// Wrap a connected transport.
    pub fn new(transport: BoxedTransport) -> Self {
        Self {
            stream: BufReader::new(transport),
            line: String::new(),
        }
    }

    /// Send one command line.
    pub async fn send(&mut self, command: &str) -> Result<(), BackendError> {
        let writer = self.stream.get_mut();
        writer.write_all(command.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one line, trimmed. End of stream is a disconnect.
    pub async fn read_line(&mut self) -> Result<&str, BackendError> {
        self.line.clear();
        let n = self.stream.read_line(&mut self.line).await?;
        if n == 0 {
            return Err(BackendError::Disconnected("end of stream".into()));
        }
        let line = self.line.trim();
        if let Some(message) = line.strip_prefix("ERR") {
            return Err(BackendError::Device(message.trim().to_string()));
        }
        Ok(line)
    }

    /// Send a command and return its one-line reply.
    pub async fn query(&mut self, command: &str) -> Result<String, BackendError> {
        self.send(command).await?;
        Ok(self.read_line().await?.to_string())
    }

    /// Send a command that must be acknowledged with `OK`.
    pub async fn command(&mut self, command: &str) -> Result<(), BackendError> {
        let reply = self.query(command).await?;
        if reply == "OK" {
            Ok(())
        } else {
            Err(BackendError::Protocol(format!(
                "expected OK to '{}', got '{}'",
                command, reply
            )))
        }
    }

    /// Fill `buf` from the stream (binary payloads).
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), BackendError> {
        match self.stream.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(BackendError::Disconnected("end of stream".into()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Parse a `CAPS <max_channels> <rates>` reply.
pub fn parse_caps(
    reply: &str,
    supports_pause: bool,
    self_paced: bool,
) -> Result<BackendCapabilities, BackendError> {
    let malformed = || BackendError::Protocol(format!("malformed CAPS reply '{}'", reply));
    let mut fields = reply.split_whitespace();
    if fields.next() != Some("CAPS") {
        return Err(malformed());
    }
    let max_channels = fields
        .next()
        .and_then(|f| f.parse::<u32>().ok())
        .ok_or_else(malformed)?;
    let supported_rates = fields
        .next()
        .ok_or_else(malformed)?
        .split(',')
        .map(|r| r.trim().parse::<f64>().map_err(|_| malformed()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(BackendCapabilities {
        max_channels,
        supported_rates,
        supports_pause,
        self_paced,
    })
}

/// Parse one comma-separated scan of `channels` values.
pub fn parse_scan(line: &str, channels: usize) -> Result<Vec<f64>, BackendError> {
    let values = line
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| BackendError::Protocol(format!("unparseable scan '{}'", line)))?;
    if values.len() != channels {
        return Err(BackendError::Protocol(format!(
            "scan has {} values, expected {}",
            values.len(),
            channels
        )));
    }
    Ok(values)
}
