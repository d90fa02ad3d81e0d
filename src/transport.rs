use async_trait::async_trait;
use bytes::Bytes;
use std::{io, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{HrError, Result},
    types::{ConnectionState, TransportConfig},
};

/// An open byte channel to a device
#[async_trait]
pub trait Link: Send {
    /// Wait for data and read what is available into `buf`
    ///
    /// Returns `Ok(0)` when the device closed the link. Must be cancel safe:
    /// the poll task abandons pending reads on timeout.
    async fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send bytes to the device
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Close the link
    async fn close(&mut self) -> io::Result<()>;
}

/// [`Link`] over any tokio byte stream
#[derive(Debug)]
pub struct StreamLink<S> {
    stream: S,
}

impl<S> StreamLink<S> {
    /// Wrap a connected stream
    pub const fn new(stream: S) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl<S> Link for StreamLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf).await
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

/// Why a single channel could not be opened
#[derive(Debug)]
pub enum ChannelError {
    /// The device definitively refused; probing stops
    Refused,
    /// Nothing listens on this channel; probing continues
    Unavailable(String),
    /// Local socket failure
    Os(io::Error),
}

impl From<io::Error> for ChannelError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::Refused,
            io::ErrorKind::NotFound
            | io::ErrorKind::TimedOut
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::AddrNotAvailable => Self::Unavailable(err.to_string()),
            _ => Self::Os(err),
        }
    }
}

/// Opens links to a device address on a numbered channel
#[async_trait]
pub trait Connector: Send + Sync {
    /// Try to open `channel` on the device at `address`
    async fn open(
        &self,
        address: &str,
        channel: u8,
    ) -> std::result::Result<Box<dyn Link>, ChannelError>;

    /// Human-readable connector name
    fn name(&self) -> &'static str;
}

/// Connector for serial-to-TCP bridges and simulators
///
/// Channel `n` of host `address` is reached on TCP port `port_base + n`.
#[derive(Debug, Clone, Copy)]
pub struct TcpConnector {
    port_base: u16,
}

impl TcpConnector {
    /// Create a connector mapping channels onto ports above `port_base`
    #[must_use]
    pub const fn new(port_base: u16) -> Self {
        Self { port_base }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn open(
        &self,
        address: &str,
        channel: u8,
    ) -> std::result::Result<Box<dyn Link>, ChannelError> {
        let port = self.port_base.checked_add(u16::from(channel)).ok_or_else(|| {
            ChannelError::Unavailable(format!("channel {channel} is beyond the port range"))
        })?;

        let stream = TcpStream::connect((address, port)).await?;
        stream.set_nodelay(true).map_err(ChannelError::Os)?;
        Ok(Box::new(StreamLink::new(stream)))
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

/// Consumer of bytes read by the poll task
///
/// Called on the poll task; the next read starts only after it returns.
pub trait ByteSink: Send + Sync {
    /// Bytes arrived from the device, in order
    fn on_bytes(&self, data: &[u8]);
}

impl<F> ByteSink for F
where
    F: Fn(&[u8]) + Send + Sync,
{
    fn on_bytes(&self, data: &[u8]) {
        self(data);
    }
}

/// Duplex byte link to one heart-rate monitor
///
/// Drives the connection state machine `Disconnected → Connecting →
/// Connected → DisconnectRequested → Disconnecting → Disconnected`.
/// Connecting probes a range of channels through a [`Connector`]; once a
/// [`Link`] is open a background task reads from it with a bounded timeout
/// and hands every read to a [`ByteSink`] before reading again.
pub struct Transport {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    state: Arc<Mutex<ConnectionState>>,
    writer: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Create a disconnected transport
    pub fn new(connector: Arc<dyn Connector>, config: TransportConfig) -> Self {
        Self {
            connector,
            config,
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            writer: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Transport configuration
    #[must_use]
    pub const fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Current connection state
    pub async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    /// Check if the link is up and being polled
    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// Connect to `address` and start forwarding received bytes to `sink`
    ///
    /// Channels are probed in order until one accepts. A refused connection
    /// ends the probe early.
    ///
    /// # Errors
    ///
    /// Returns [`HrError::NotConfigured`] for an empty address,
    /// [`HrError::InvalidState`] unless disconnected,
    /// [`HrError::DeviceUnavailable`] if no channel accepts,
    /// or [`HrError::Transport`] on a local socket failure.
    pub async fn connect(&self, address: &str, sink: Arc<dyn ByteSink>) -> Result<()> {
        let address = address.trim();
        if address.is_empty() {
            return Err(HrError::NotConfigured);
        }

        {
            let mut state = self.state.lock().await;
            if *state != ConnectionState::Disconnected {
                return Err(HrError::InvalidState { state: *state });
            }
            *state = ConnectionState::Connecting;
        }

        let link = match self.probe(address).await {
            Ok(link) => link,
            Err(e) => {
                *self.state.lock().await = ConnectionState::Disconnected;
                return Err(e);
            }
        };

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        *self.writer.lock().await = Some(write_tx);
        *self.state.lock().await = ConnectionState::Connected;

        let handle = tokio::spawn(poll_link(
            link,
            Arc::clone(&self.state),
            sink,
            write_rx,
            self.config.clone(),
        ));
        *self.task.lock().await = Some(handle);

        Ok(())
    }

    async fn probe(&self, address: &str) -> Result<Box<dyn Link>> {
        let first = self.config.first_channel;
        let last = self.config.last_channel;
        info!(
            "Connecting to {} over {} (channels {}..={})",
            address,
            self.connector.name(),
            first,
            last
        );

        for channel in first..=last {
            match self.connector.open(address, channel).await {
                Ok(link) => {
                    info!("Connected to {} on channel {}", address, channel);
                    return Ok(link);
                }
                Err(ChannelError::Refused) => {
                    debug!("Channel {} refused, giving up", channel);
                    break;
                }
                Err(ChannelError::Unavailable(reason)) => {
                    debug!("Channel {} unavailable: {}", channel, reason);
                }
                Err(ChannelError::Os(e)) => return Err(HrError::Transport(e)),
            }
        }

        Err(HrError::DeviceUnavailable {
            address: address.to_string(),
            first,
            last,
        })
    }

    /// Send raw bytes to the device
    ///
    /// # Errors
    ///
    /// Returns [`HrError::InvalidState`] when not connected.
    pub async fn write(&self, data: Bytes) -> Result<()> {
        let state = self.state().await;
        if state != ConnectionState::Connected {
            return Err(HrError::InvalidState { state });
        }

        let writer = self.writer.lock().await;
        match writer.as_ref() {
            Some(tx) if tx.send(data).is_ok() => Ok(()),
            _ => Err(HrError::InvalidState {
                state: self.state().await,
            }),
        }
    }

    /// Ask the poll task to stop
    ///
    /// Returns immediately; the poll task notices within one poll timeout.
    /// Use [`Self::wait_for_disconnect`] to wait for it.
    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        match *state {
            ConnectionState::Connected => {
                info!("Disconnect requested");
                *state = ConnectionState::DisconnectRequested;
            }
            ConnectionState::Connecting => {
                warn!("Disconnect requested while connecting, ignored");
            }
            _ => {}
        }
    }

    /// Block until the state machine is back at `Disconnected`
    pub async fn wait_for_disconnect(&self) {
        while self.state().await != ConnectionState::Disconnected {
            sleep(self.config.disconnect_poll_interval()).await;
        }

        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Poll task ended abnormally: {}", e);
            }
        }
        *self.writer.lock().await = None;
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.try_lock() {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::DisconnectRequested;
            }
        }
    }
}

/// Read from `link` until asked to stop or the link fails
async fn poll_link(
    mut link: Box<dyn Link>,
    state: Arc<Mutex<ConnectionState>>,
    sink: Arc<dyn ByteSink>,
    mut writes: mpsc::UnboundedReceiver<Bytes>,
    config: TransportConfig,
) {
    let mut buf = vec![0u8; config.read_buffer_size.max(1)];
    let poll_timeout = config.poll_timeout();

    loop {
        if *state.lock().await != ConnectionState::Connected {
            debug!("Poll task stopping");
            break;
        }

        tokio::select! {
            read = timeout(poll_timeout, link.read_available(&mut buf)) => match read {
                Err(_) => debug!("No data within {:?}", poll_timeout),
                Ok(Ok(0)) => {
                    error!("Link closed by device");
                    break;
                }
                Ok(Ok(n)) => sink.on_bytes(&buf[..n]),
                Ok(Err(e)) => {
                    error!("Read failed: {}", e);
                    break;
                }
            },
            Some(data) = writes.recv() => {
                if let Err(e) = link.write_all(&data).await {
                    error!("Write failed: {}", e);
                    break;
                }
            }
        }
    }

    *state.lock().await = ConnectionState::Disconnecting;
    if let Err(e) = link.close().await {
        debug!("Closing link failed: {}", e);
    }
    *state.lock().await = ConnectionState::Disconnected;
    info!("Disconnected");
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use tokio::io::DuplexStream;

    /// Connector with scripted per-channel outcomes, handing out in-memory links
    pub(crate) struct ScriptedConnector {
        pub(crate) attempts: std::sync::Mutex<Vec<u8>>,
        pub(crate) accept_on: Option<u8>,
        pub(crate) refuse_on: Option<u8>,
        pub(crate) os_error: bool,
        links: std::sync::Mutex<VecDeque<DuplexStream>>,
    }

    impl ScriptedConnector {
        /// Accept on `channel`; returns the connector and the device end of the link
        pub(crate) fn accepting(channel: u8) -> (Self, DuplexStream) {
            let (connector, mut devices) = Self::accepting_many(channel, 1);
            (connector, devices.remove(0))
        }

        /// Accept `count` successive connections on `channel`
        pub(crate) fn accepting_many(channel: u8, count: usize) -> (Self, Vec<DuplexStream>) {
            let mut hosts = VecDeque::new();
            let mut devices = Vec::new();
            for _ in 0..count {
                let (host, device) = tokio::io::duplex(4096);
                hosts.push_back(host);
                devices.push(device);
            }
            let connector = Self {
                attempts: std::sync::Mutex::new(Vec::new()),
                accept_on: Some(channel),
                refuse_on: None,
                os_error: false,
                links: std::sync::Mutex::new(hosts),
            };
            (connector, devices)
        }

        pub(crate) fn refusing(channel: u8) -> Self {
            Self {
                attempts: std::sync::Mutex::new(Vec::new()),
                accept_on: None,
                refuse_on: Some(channel),
                os_error: false,
                links: std::sync::Mutex::new(VecDeque::new()),
            }
        }

        pub(crate) fn attempts(&self) -> Vec<u8> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn open(
            &self,
            _address: &str,
            channel: u8,
        ) -> std::result::Result<Box<dyn Link>, ChannelError> {
            self.attempts.lock().unwrap().push(channel);
            if self.os_error {
                return Err(ChannelError::Os(io::Error::other("socket")));
            }
            if self.refuse_on == Some(channel) {
                return Err(ChannelError::Refused);
            }
            if self.accept_on == Some(channel) {
                if let Some(stream) = self.links.lock().unwrap().pop_front() {
                    return Ok(Box::new(StreamLink::new(stream)));
                }
                return Err(ChannelError::Refused);
            }
            Err(ChannelError::Unavailable("no service".to_string()))
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    /// Short timings so tests finish quickly
    pub(crate) fn fast_config() -> TransportConfig {
        TransportConfig {
            poll_timeout_ms: 20,
            disconnect_poll_interval_ms: 5,
            ..TransportConfig::default()
        }
    }

    /// Poll `condition` until it holds or two seconds pass
    pub(crate) async fn eventually(condition: impl Fn() -> bool) -> bool {
        for _ in 0..400 {
            if condition() {
                return true;
            }
            sleep(std::time::Duration::from_millis(5)).await;
        }
        condition()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{eventually, fast_config, ScriptedConnector};
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::net::TcpListener;

    fn collecting_sink() -> (Arc<dyn ByteSink>, Arc<StdMutex<Vec<u8>>>) {
        let received = Arc::new(StdMutex::new(Vec::new()));
        let sink_received = Arc::clone(&received);
        let sink: Arc<dyn ByteSink> = Arc::new(move |data: &[u8]| {
            sink_received.lock().unwrap().extend_from_slice(data);
        });
        (sink, received)
    }

    #[tokio::test]
    async fn test_empty_address_not_configured() {
        let (connector, _device) = ScriptedConnector::accepting(1);
        let transport = Transport::new(Arc::new(connector), fast_config());
        let (sink, _) = collecting_sink();

        let result = transport.connect("  ", sink).await;
        assert!(matches!(result, Err(HrError::NotConfigured)));
        assert_eq!(transport.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_probe_stops_at_refusal() {
        let connector = Arc::new(ScriptedConnector::refusing(3));
        let transport = Transport::new(connector.clone(), fast_config());
        let (sink, _) = collecting_sink();

        let result = transport.connect("monitor", sink).await;

        assert!(matches!(
            result,
            Err(HrError::DeviceUnavailable { first: 1, last: 30, .. })
        ));
        assert_eq!(connector.attempts(), vec![1, 2, 3]);
        assert_eq!(transport.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_probe_exhausts_channel_range() {
        let connector = Arc::new(ScriptedConnector::refusing(0));
        let transport = Transport::new(connector.clone(), fast_config());
        let (sink, _) = collecting_sink();

        let result = transport.connect("monitor", sink).await;

        assert!(matches!(result, Err(HrError::DeviceUnavailable { .. })));
        assert_eq!(connector.attempts(), (1..=30).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn test_socket_failure_is_transport_error() {
        let mut connector = ScriptedConnector::refusing(0);
        connector.os_error = true;
        let transport = Transport::new(Arc::new(connector), fast_config());
        let (sink, _) = collecting_sink();

        let result = transport.connect("monitor", sink).await;
        assert!(matches!(result, Err(HrError::Transport(_))));
        assert_eq!(transport.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_bytes_forwarded_in_order_and_disconnect() {
        let (connector, mut device) = ScriptedConnector::accepting(4);
        let connector = Arc::new(connector);
        let transport = Transport::new(connector.clone(), fast_config());
        let (sink, received) = collecting_sink();

        transport.connect("monitor", sink).await.unwrap();
        assert!(transport.is_connected().await);
        assert_eq!(connector.attempts(), vec![1, 2, 3, 4]);

        device.write_all(&[1, 2, 3]).await.unwrap();
        device.write_all(&[4, 5]).await.unwrap();
        assert!(eventually(|| received.lock().unwrap().len() == 5).await);
        assert_eq!(*received.lock().unwrap(), vec![1, 2, 3, 4, 5]);

        transport.disconnect().await;
        assert_ne!(transport.state().await, ConnectionState::Connected);
        transport.wait_for_disconnect().await;
        assert_eq!(transport.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let (connector, _device) = ScriptedConnector::accepting(1);
        let transport = Transport::new(Arc::new(connector), fast_config());
        let (sink, _) = collecting_sink();

        transport.connect("monitor", sink.clone()).await.unwrap();
        let again = transport.connect("monitor", sink).await;
        assert!(matches!(
            again,
            Err(HrError::InvalidState {
                state: ConnectionState::Connected
            })
        ));

        transport.disconnect().await;
        transport.wait_for_disconnect().await;
    }

    #[tokio::test]
    async fn test_device_closing_link() {
        let (connector, device) = ScriptedConnector::accepting(1);
        let transport = Arc::new(Transport::new(Arc::new(connector), fast_config()));
        let (sink, _) = collecting_sink();

        transport.connect("monitor", sink).await.unwrap();
        drop(device);

        transport.wait_for_disconnect().await;
        assert!(!transport.is_connected().await);
    }

    #[tokio::test]
    async fn test_write_reaches_device() {
        let (connector, mut device) = ScriptedConnector::accepting(1);
        let transport = Transport::new(Arc::new(connector), fast_config());
        let (sink, _) = collecting_sink();

        assert!(matches!(
            transport.write(Bytes::from_static(b"x")).await,
            Err(HrError::InvalidState { .. })
        ));

        transport.connect("monitor", sink).await.unwrap();
        transport.write(Bytes::from_static(b"ping")).await.unwrap();

        let mut buf = [0u8; 4];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        transport.disconnect().await;
        transport.wait_for_disconnect().await;
    }

    #[tokio::test]
    async fn test_tcp_connector_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = TransportConfig {
            first_channel: 1,
            last_channel: 1,
            ..fast_config()
        };
        let transport = Transport::new(Arc::new(TcpConnector::new(port - 1)), config);
        let (sink, received) = collecting_sink();

        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"FRWD").await.unwrap();
            socket
        });

        transport.connect("127.0.0.1", sink).await.unwrap();
        let _socket = accept.await.unwrap();
        assert!(eventually(|| received.lock().unwrap().as_slice() == b"FRWD").await);

        transport.disconnect().await;
        transport.wait_for_disconnect().await;
    }

    #[tokio::test]
    async fn test_stream_link_over_mock() {
        let mock = tokio_test::io::Builder::new()
            .read(b"abc")
            .read(b"de")
            .write(b"ack")
            .build();
        let mut link = StreamLink::new(mock);
        let mut buf = [0u8; 16];

        assert_eq!(link.read_available(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(link.read_available(&mut buf).await.unwrap(), 2);
        link.write_all(b"ack").await.unwrap();
    }

    #[test]
    fn test_channel_error_mapping() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(matches!(ChannelError::from(refused), ChannelError::Refused));

        let timed_out = io::Error::from(io::ErrorKind::TimedOut);
        assert!(matches!(
            ChannelError::from(timed_out),
            ChannelError::Unavailable(_)
        ));

        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(matches!(ChannelError::from(denied), ChannelError::Os(_)));
    }
}
