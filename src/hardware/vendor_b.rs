//! Vendor B networked wave-probe amplifier.
//!
//! Control is ASCII over TCP (same verbs as vendor A: `*IDN?`, `CAPS?`,
//! `CONF`, `START`, `STOP`). After `START` is acknowledged the device
//! switches the socket to a binary stream of scans, each scan being one
//! little-endian `f32` per configured channel. `STOP` ends the stream and
//! is not acknowledged; the socket is closed right after.

use crate::hardware::backend::{
    BackendCapabilities, BackendDescriptor, BackendError, BackendKind, ConnectionStatus,
    HardwareBackend,
};
use crate::hardware::line_link::{parse_caps, BoxedTransport, LineLink};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::info;

/// Capabilities advertised before the device is contacted.
pub fn vendor_b_capabilities() -> BackendCapabilities {
    BackendCapabilities {
        max_channels: 32,
        supported_rates: vec![50.0, 100.0, 200.0, 500.0, 1000.0],
        supports_pause: false,
        self_paced: true,
    }
}

enum Endpoint {
    Tcp(String),
    Transport(Option<BoxedTransport>),
}

/// Vendor B adapter.
pub struct VendorBBackend {
    endpoint: Endpoint,
    link: Option<LineLink>,
    model: String,
    capabilities: BackendCapabilities,
    status: ConnectionStatus,
    channels: usize,
    scratch: Vec<u8>,
}

impl VendorBBackend {
    /// Adapter for a device at `host:port`.
    pub fn tcp(address: impl Into<String>) -> Self {
        Self::with_endpoint(Endpoint::Tcp(address.into()))
    }

    /// Adapter over an already-connected transport.
    pub fn with_transport(transport: BoxedTransport) -> Self {
        Self::with_endpoint(Endpoint::Transport(Some(transport)))
    }

    fn with_endpoint(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            link: None,
            model: "vendor B amplifier".to_string(),
            capabilities: vendor_b_capabilities(),
            status: ConnectionStatus::Disconnected,
            channels: 0,
            scratch: Vec::new(),
        }
    }

    async fn connect(&mut self) -> Result<(String, BoxedTransport), BackendError> {
        match &mut self.endpoint {
            Endpoint::Tcp(address) => {
                let stream = TcpStream::connect(address.as_str()).await.map_err(|e| {
                    BackendError::OpenFailed {
                        target: address.clone(),
                        message: e.to_string(),
                    }
                })?;
                stream.set_nodelay(true)?;
                Ok((address.clone(), Box::new(stream)))
            }
            Endpoint::Transport(transport) => transport
                .take()
                .map(|t| ("preconnected transport".to_string(), t))
                .ok_or_else(|| BackendError::OpenFailed {
                    target: "preconnected transport".into(),
                    message: "transport already consumed".into(),
                }),
        }
    }

    fn link(&mut self) -> Result<&mut LineLink, BackendError> {
        self.link.as_mut().ok_or(BackendError::NotOpen)
    }
}

/// Split scan-major little-endian `f32` bytes into per-channel vectors.
fn decode_scans(bytes: &[u8], channels: usize) -> Vec<Vec<f64>> {
    let scans = bytes.len() / (4 * channels);
    let mut out = vec![Vec::with_capacity(scans); channels];
    for (i, chunk) in bytes.chunks_exact(4).enumerate() {
        let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        out[i % channels].push(f64::from(value));
    }
    out
}

#[async_trait]
impl HardwareBackend for VendorBBackend {
    fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor {
            kind: BackendKind::VendorB,
            model: self.model.clone(),
            capabilities: self.capabilities.clone(),
            status: self.status,
        }
    }

    async fn open(&mut self) -> Result<(), BackendError> {
        let (target, transport) = self.connect().await?;
        let mut link = LineLink::new(transport);
        self.model = link.query("*IDN?").await?;
        let caps = link.query("CAPS?").await?;
        self.capabilities = parse_caps(&caps, false, true)?;
        self.link = Some(link);
        self.status = ConnectionStatus::Connected;
        info!(target = %target, model = %self.model, "vendor B amplifier connected");
        Ok(())
    }

    async fn configure(&mut self, channels: &[u32], sample_rate: f64) -> Result<(), BackendError> {
        self.capabilities
            .negotiate(channels.len() as u32, sample_rate)
            .map_err(BackendError::InvalidConfig)?;
        let command = format!("CONF {} {}", channels.len(), sample_rate);
        self.link()?.command(&command).await?;
        self.channels = channels.len();
        Ok(())
    }

    async fn start(&mut self) -> Result<(), BackendError> {
        if self.channels == 0 {
            return Err(BackendError::InvalidConfig("start before configure".into()));
        }
        self.link()?.command("START").await?;
        self.status = ConnectionStatus::Streaming;
        Ok(())
    }

    async fn read_block(
        &mut self,
        samples_per_channel: usize,
    ) -> Result<Vec<Vec<f64>>, BackendError> {
        if self.status != ConnectionStatus::Streaming {
            return Err(BackendError::NotStreaming);
        }
        let len = samples_per_channel * self.channels * 4;
        self.scratch.resize(len, 0);
        let link = self.link.as_mut().ok_or(BackendError::NotOpen)?;
        if let Err(e) = link.read_exact(&mut self.scratch).await {
            self.status = ConnectionStatus::Faulted;
            return Err(e);
        }
        Ok(decode_scans(&self.scratch, self.channels))
    }

    async fn stop(&mut self) -> Result<(), BackendError> {
        if self.status == ConnectionStatus::Streaming {
            self.link()?.send("STOP").await?;
            self.status = ConnectionStatus::Connected;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        self.link = None;
        self.status = ConnectionStatus::Disconnected;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Answer one command per reply, then write `payload` and hang up.
    async fn fake_amplifier<S>(stream: S, replies: &[&str], payload: Vec<u8>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = BufReader::new(stream);
        for reply in replies {
            let mut command = String::new();
            stream.read_line(&mut command).await.unwrap();
            stream
                .get_mut()
                .write_all(format!("{}\n", reply).as_bytes())
                .await
                .unwrap();
        }
        stream.get_mut().write_all(&payload).await.unwrap();
        stream.get_mut().flush().await.unwrap();
    }

    fn scans(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_decode_scans() {
        let bytes = scans(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let channels = decode_scans(&bytes, 2);
        assert_eq!(channels, vec![vec![1.0, 3.0, 5.0], vec![2.0, 4.0, 6.0]]);
    }

    #[tokio::test]
    async fn test_tcp_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let device = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            // 2 scans x 3 channels
            let payload = scans(&[0.0, 0.5, 1.0, 1.5, 2.0, 2.5]);
            fake_amplifier(socket, &["AMP-32 v1.4", "CAPS 32 50,100", "OK", "OK"], payload).await;
        });

        let mut backend = VendorBBackend::tcp(address);
        backend.open().await.unwrap();
        assert_eq!(backend.descriptor().model, "AMP-32 v1.4");
        backend.configure(&[0, 1, 2], 100.0).await.unwrap();
        backend.start().await.unwrap();
        let block = backend.read_block(2).await.unwrap();
        assert_eq!(block, vec![vec![0.0, 1.5], vec![0.5, 2.0], vec![1.0, 2.5]]);
        device.await.unwrap();
        backend.close().await.unwrap();
        assert_eq!(backend.descriptor().status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_unreachable_address_fails_to_open() {
        // Bind then drop to obtain a port with no listener.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut backend = VendorBBackend::tcp(address);
        assert!(matches!(
            backend.open().await,
            Err(BackendError::OpenFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_short_stream_is_disconnect() {
        let (client, server) = tokio::io::duplex(1024);
        tokio::spawn(fake_amplifier(
            server,
            &["AMP-32", "CAPS 4 50", "OK", "OK"],
            scans(&[1.0]),
        ));

        let mut backend = VendorBBackend::with_transport(Box::new(client));
        backend.open().await.unwrap();
        backend.configure(&[0, 1], 50.0).await.unwrap();
        backend.start().await.unwrap();
        assert!(matches!(
            backend.read_block(4).await,
            Err(BackendError::Disconnected(_))
        ));
        assert_eq!(backend.descriptor().status, ConnectionStatus::Faulted);
    }
}
