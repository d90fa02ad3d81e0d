use crate::{
    decoder::{decoder_for, Decoded, DecoderStats, StreamDecoder},
    error::{HrError, Result},
    observer::{Registry, SampleObserver, Selector, Token},
    transport::{ByteSink, Connector, Transport},
    types::{ConnectionState, MonitorConfig},
};
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::SystemTime,
};
use tracing::{debug, info};

/// Lock a std mutex, carrying on with the data if a panicking observer poisoned it
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Decoded stream of one heart-rate monitor
///
/// `EcgSource` owns the [`Transport`] and the stream decoder for the
/// configured wire format, and fans decoded units out to registered
/// [`SampleObserver`]s. The link is only open while someone listens:
///
/// - the first [`add_observer`](Self::add_observer) connects to the device,
///   and fails without registering anything if that connection fails;
/// - removing the last observer disconnects and resets all decode state, so
///   nothing buffered survives into the next session.
///
/// # Examples
///
/// ```no_run
/// use hrstream::{EcgSource, FrameFormat, MonitorConfig, TcpConnector, Token};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = MonitorConfig::new("127.0.0.1", FrameFormat::Vendor);
///     let source = EcgSource::new(config, Arc::new(TcpConnector::new(7000)));
///
///     source
///         .add_observer(
///             Arc::new(|_: &str, sample: &hrstream::DecodedSample, _: Token| {
///                 println!("{} bpm", sample.heart_rate_bpm);
///             }),
///             Token(1),
///         )
///         .await?;
///     Ok(())
/// }
/// ```
pub struct EcgSource {
    config: MonitorConfig,
    transport: Transport,
    shared: Arc<SourceShared>,
    lifecycle: tokio::sync::Mutex<()>,
}

/// State touched by the poll task
struct SourceShared {
    source: String,
    decoder: Mutex<Box<dyn StreamDecoder>>,
    observers: Mutex<Registry<dyn SampleObserver>>,
}

impl ByteSink for SourceShared {
    fn on_bytes(&self, data: &[u8]) {
        let decoded = lock(&self.decoder).push(data, SystemTime::now());
        if decoded.is_empty() {
            return;
        }

        let subscribers = lock(&self.observers).snapshot();
        for unit in &decoded {
            for sub in &subscribers {
                match unit {
                    Decoded::Sample(sample) => {
                        sub.observer.on_sample(&self.source, sample, sub.token);
                    }
                    Decoded::Chunk(chunk) => {
                        sub.observer.on_chunk(&self.source, chunk, sub.token);
                    }
                }
            }
        }
    }
}

impl EcgSource {
    /// Create a disconnected source
    pub fn new(config: MonitorConfig, connector: Arc<dyn Connector>) -> Self {
        let transport = Transport::new(connector, config.transport.clone());
        let shared = Arc::new(SourceShared {
            source: config.address().unwrap_or_default().to_string(),
            decoder: Mutex::new(decoder_for(config.format)),
            observers: Mutex::new(Registry::new()),
        });

        Self {
            config,
            transport,
            shared,
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Source configuration
    #[must_use]
    pub const fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Underlying transport
    #[must_use]
    pub const fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Current connection state
    pub async fn state(&self) -> ConnectionState {
        self.transport.state().await
    }

    /// Check if the device link is up
    pub async fn is_connected(&self) -> bool {
        self.transport.is_connected().await
    }

    /// Decoder counters for the current session
    #[must_use]
    pub fn stats(&self) -> DecoderStats {
        lock(&self.shared.decoder).stats()
    }

    /// Number of live registrations
    #[must_use]
    pub fn observer_count(&self) -> usize {
        lock(&self.shared.observers).len()
    }

    /// Register an observer for decoded samples and chunks
    ///
    /// Connects to the device when the link is down, which is always the
    /// case for the first registration.
    ///
    /// # Errors
    ///
    /// Returns [`HrError::NotConfigured`] without an address, or any
    /// connection error from [`Transport::connect`]. Nothing is registered
    /// on error.
    pub async fn add_observer(
        &self,
        observer: Arc<dyn SampleObserver>,
        token: Token,
    ) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        if self.transport.state().await == ConnectionState::Disconnected {
            let address = self.config.address().ok_or(HrError::NotConfigured)?;
            lock(&self.shared.decoder).reset();

            let sink: Arc<dyn ByteSink> = self.shared.clone();
            self.transport.connect(address, sink).await?;
            info!(
                "Streaming {} frames from {}",
                self.config.format, self.shared.source
            );
        }

        lock(&self.shared.observers).add(observer, token);
        debug!("Observer {} registered", token);
        Ok(())
    }

    /// Remove every registration matching both selectors
    ///
    /// When the last registration goes, the link is closed and the decoder
    /// reset before this returns. Returns the number of registrations
    /// removed.
    pub async fn remove_observer(
        &self,
        observer: Selector<&Arc<dyn SampleObserver>>,
        token: Selector<Token>,
    ) -> usize {
        let _guard = self.lifecycle.lock().await;

        let (removed, now_empty) = {
            let mut observers = lock(&self.shared.observers);
            let removed = observers.remove(observer, token);
            (removed, observers.is_empty())
        };

        if removed > 0 && now_empty {
            self.transport.disconnect().await;
            self.transport.wait_for_disconnect().await;
            lock(&self.shared.decoder).reset();
            info!("Last observer removed, stream from {} closed", self.shared.source);
        }

        removed
    }
}
