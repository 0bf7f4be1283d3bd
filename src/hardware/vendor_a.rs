//! Vendor A serial wave-gauge controller.
//!
//! Protocol Overview:
//! - ASCII lines, LF terminated
//! - `*IDN?` → model string
//! - `CAPS?` → `CAPS <max_channels> <rate>[,<rate>...]`
//! - `CONF <channels> <rate>` → `OK`
//! - `START` → `OK`, then one scan per line: `<ch0>,<ch1>,...` in metres
//! - `STOP` → remaining scans, then `OK`
//! - any command may be answered with `ERR <message>`
//!
//! The controller paces the stream itself, so `read_block` simply waits for
//! the requested number of scans. It has no pause command; scans that were
//! read before a pause are dropped with [`discard_pending`].
//!
//! The serial transport needs the `vendor_a_serial` feature. Without it,
//! `open()` fails with [`BackendError::OpenFailed`] and the manager either
//! reports the backend unavailable or falls back to simulation.
//!
//! [`discard_pending`]: HardwareBackend::discard_pending

use crate::hardware::backend::{
    BackendCapabilities, BackendDescriptor, BackendError, BackendKind, ConnectionStatus,
    HardwareBackend,
};
use crate::hardware::line_link::{parse_caps, parse_scan, BoxedTransport, LineLink};
use async_trait::async_trait;
use tracing::{debug, info};

/// Upper bound on scans drained while waiting for the `STOP` acknowledgement.
const MAX_STOP_DRAIN_LINES: usize = 100_000;

/// Capabilities advertised before the device is contacted.
pub fn vendor_a_capabilities() -> BackendCapabilities {
    BackendCapabilities {
        max_channels: 8,
        supported_rates: vec![16.0, 32.0, 64.0, 128.0],
        supports_pause: false,
        self_paced: true,
    }
}

/// How the adapter reaches the controller.
pub enum Connector {
    /// Serial device path and baud rate
    Serial {
        /// e.g. `/dev/ttyUSB0`
        path: String,
        /// Baud rate
        baud_rate: u32,
    },
    /// Already-connected transport (used once)
    Transport(Option<BoxedTransport>),
}

impl Connector {
    fn target(&self) -> String {
        match self {
            Connector::Serial { path, .. } => path.clone(),
            Connector::Transport(_) => "preconnected transport".to_string(),
        }
    }

    fn connect(&mut self) -> Result<BoxedTransport, BackendError> {
        match self {
            Connector::Serial { path, baud_rate } => open_serial(path, *baud_rate),
            Connector::Transport(transport) => transport.take().ok_or_else(|| {
                BackendError::OpenFailed {
                    target: "preconnected transport".into(),
                    message: "transport already consumed".into(),
                }
            }),
        }
    }
}

#[cfg(feature = "vendor_a_serial")]
fn open_serial(path: &str, baud_rate: u32) -> Result<BoxedTransport, BackendError> {
    use tokio_serial::SerialPortBuilderExt;

    let port = tokio_serial::new(path, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| BackendError::OpenFailed {
            target: path.to_string(),
            message: e.to_string(),
        })?;
    Ok(Box::new(port))
}

#[cfg(not(feature = "vendor_a_serial"))]
fn open_serial(path: &str, _baud_rate: u32) -> Result<BoxedTransport, BackendError> {
    Err(BackendError::OpenFailed {
        target: path.to_string(),
        message: "serial support not built (enable the vendor_a_serial feature)".into(),
    })
}

/// Vendor A adapter.
pub struct VendorABackend {
    connector: Connector,
    link: Option<LineLink>,
    model: String,
    capabilities: BackendCapabilities,
    status: ConnectionStatus,
    channels: usize,
    pending: Vec<Vec<f64>>,
}

impl VendorABackend {
    /// Adapter for a serial controller.
    pub fn serial(path: impl Into<String>, baud_rate: u32) -> Self {
        Self::with_connector(Connector::Serial {
            path: path.into(),
            baud_rate,
        })
    }

    /// Adapter over an already-connected transport.
    pub fn with_transport(transport: BoxedTransport) -> Self {
        Self::with_connector(Connector::Transport(Some(transport)))
    }

    fn with_connector(connector: Connector) -> Self {
        Self {
            connector,
            link: None,
            model: "vendor A wave-gauge controller".to_string(),
            capabilities: vendor_a_capabilities(),
            status: ConnectionStatus::Disconnected,
            channels: 0,
            pending: Vec::new(),
        }
    }

    fn link(&mut self) -> Result<&mut LineLink, BackendError> {
        self.link.as_mut().ok_or(BackendError::NotOpen)
    }

    fn pending_scans(&self) -> usize {
        self.pending.first().map_or(0, Vec::len)
    }
}

#[async_trait]
impl HardwareBackend for VendorABackend {
    fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor {
            kind: BackendKind::VendorA,
            model: self.model.clone(),
            capabilities: self.capabilities.clone(),
            status: self.status,
        }
    }

    async fn open(&mut self) -> Result<(), BackendError> {
        let target = self.connector.target();
        let mut link = LineLink::new(self.connector.connect()?);
        self.model = link.query("*IDN?").await?;
        let caps = link.query("CAPS?").await?;
        self.capabilities = parse_caps(&caps, false, true)?;
        self.link = Some(link);
        self.status = ConnectionStatus::Connected;
        info!(target = %target, model = %self.model, "vendor A controller connected");
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
        self.pending = vec![Vec::new(); self.channels];
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
        let channels = self.channels;
        while self.pending_scans() < samples_per_channel {
            let link = self.link.as_mut().ok_or(BackendError::NotOpen)?;
            let line = match link.read_line().await {
                Ok(line) => line.to_string(),
                Err(e) => {
                    self.status = ConnectionStatus::Faulted;
                    return Err(e);
                }
            };
            let scan = parse_scan(&line, channels)?;
            for (column, value) in self.pending.iter_mut().zip(scan) {
                column.push(value);
            }
        }
        Ok(self
            .pending
            .iter_mut()
            .map(|column| column.drain(..samples_per_channel).collect())
            .collect())
    }

    async fn stop(&mut self) -> Result<(), BackendError> {
        if self.status != ConnectionStatus::Streaming {
            return Ok(());
        }
        let link = self.link()?;
        link.send("STOP").await?;
        let mut drained = 0usize;
        loop {
            if link.read_line().await? == "OK" {
                break;
            }
            drained += 1;
            if drained > MAX_STOP_DRAIN_LINES {
                return Err(BackendError::Protocol(
                    "no acknowledgement to STOP".into(),
                ));
            }
        }
        debug!(drained, "vendor A stream stopped");
        self.pending.clear();
        self.status = ConnectionStatus::Connected;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        self.link = None;
        self.status = ConnectionStatus::Disconnected;
        Ok(())
    }

    fn discard_pending(&mut self) {
        self.pending.iter_mut().for_each(Vec::clear);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    /// Minimal controller emulation: streams `scans` numbered scans after START.
    async fn fake_controller(server: DuplexStream, channels: usize, scans: usize) {
        let mut device = LineLink::new(Box::new(server));
        loop {
            let command = match device.read_line().await {
                Ok(line) => line.to_string(),
                Err(_) => return,
            };
            match command.split_whitespace().next() {
                Some("*IDN?") => device.send("ACME WG-8").await.unwrap(),
                Some("CAPS?") => device.send("CAPS 8 16,32,64").await.unwrap(),
                Some("CONF") => device.send("OK").await.unwrap(),
                Some("START") => {
                    device.send("OK").await.unwrap();
                    for i in 0..scans {
                        let scan: Vec<String> =
                            (0..channels).map(|c| format!("{}", i * 10 + c)).collect();
                        device.send(&scan.join(",")).await.unwrap();
                    }
                }
                Some("STOP") => device.send("OK").await.unwrap(),
                _ => device.send("ERR unknown command").await.unwrap(),
            }
        }
    }

    #[tokio::test]
    async fn test_open_configure_and_stream() {
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(fake_controller(server, 3, 8));

        let mut backend = VendorABackend::with_transport(Box::new(client));
        backend.open().await.unwrap();
        let descriptor = backend.descriptor();
        assert_eq!(descriptor.model, "ACME WG-8");
        assert_eq!(descriptor.capabilities.supported_rates, vec![16.0, 32.0, 64.0]);

        backend.configure(&[0, 1, 2], 32.0).await.unwrap();
        backend.start().await.unwrap();
        let block = backend.read_block(4).await.unwrap();
        assert_eq!(block.len(), 3);
        assert_eq!(block[1], vec![1.0, 11.0, 21.0, 31.0]);
        let block = backend.read_block(4).await.unwrap();
        assert_eq!(block[2], vec![42.0, 52.0, 62.0, 72.0]);

        backend.stop().await.unwrap();
        backend.close().await.unwrap();
        assert_eq!(backend.descriptor().status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_rate_outside_reported_caps_is_rejected() {
        let (client, server) = tokio::io::duplex(1024);
        tokio::spawn(fake_controller(server, 2, 0));

        let mut backend = VendorABackend::with_transport(Box::new(client));
        backend.open().await.unwrap();
        let err = backend.configure(&[0, 1], 128.0).await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_partial_block_kept_until_discarded() {
        let (client, server) = tokio::io::duplex(1024);
        tokio::spawn(fake_controller(server, 2, 3));

        let mut backend = VendorABackend::with_transport(Box::new(client));
        backend.open().await.unwrap();
        backend.configure(&[0, 1], 16.0).await.unwrap();
        backend.start().await.unwrap();
        // Only three scans ever arrive.
        let result =
            tokio::time::timeout(std::time::Duration::from_millis(200), backend.read_block(4))
                .await;
        assert!(result.is_err());
        assert_eq!(backend.pending_scans(), 3);
        backend.discard_pending();
        assert_eq!(backend.pending_scans(), 0);
    }

    #[tokio::test]
    async fn test_eof_mid_stream_faults() {
        let (client, server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut device = LineLink::new(Box::new(server));
            for reply in ["ACME WG-8", "CAPS 8 16,32", "OK", "OK"] {
                device.read_line().await.unwrap();
                device.send(reply).await.unwrap();
            }
            // One scan, then the link drops.
            device.send("0.1,0.2").await.unwrap();
        });

        let mut backend = VendorABackend::with_transport(Box::new(client));
        backend.open().await.unwrap();
        backend.configure(&[0, 1], 16.0).await.unwrap();
        backend.start().await.unwrap();
        assert!(matches!(
            backend.read_block(2).await,
            Err(BackendError::Disconnected(_))
        ));
        assert_eq!(backend.descriptor().status, ConnectionStatus::Faulted);
    }

    #[cfg(not(feature = "vendor_a_serial"))]
    #[tokio::test]
    async fn test_serial_without_feature_fails_to_open() {
        let mut backend = VendorABackend::serial("/dev/ttyUSB0", 115_200);
        assert!(matches!(
            backend.open().await,
            Err(BackendError::OpenFailed { .. })
        ));
    }
}
