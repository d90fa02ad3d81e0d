use crate::{
    error::Result,
    observer::{BeatObserver, Registry, SampleObserver, Selector, Token},
    source::{lock, EcgSource},
    types::{Beat, BeatClass, DecodedSample, MonitorConfig},
};
use std::{
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};
use tracing::{debug, info, warn};

/// Ring of the most recent beat-to-beat intervals
///
/// Slots start unset and are overwritten oldest-first once the window is full.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeatIntervalWindow {
    slots: Vec<Option<Duration>>,
    next: usize,
}

impl BeatIntervalWindow {
    /// Create a window holding `capacity` intervals (at least one)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
            next: 0,
        }
    }

    /// Number of slots
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of populated slots
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Whether no interval has been recorded yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record an interval, overwriting the oldest one when full
    pub fn record(&mut self, interval: Duration) {
        self.slots[self.next] = Some(interval);
        self.next = (self.next + 1) % self.slots.len();
    }

    /// Mean over populated slots, `None` while empty
    #[must_use]
    pub fn mean(&self) -> Option<Duration> {
        let populated = self.len();
        if populated == 0 {
            return None;
        }
        let total: Duration = self.slots.iter().flatten().sum();
        let count = u32::try_from(populated).unwrap_or(u32::MAX);
        Some(total / count)
    }

    /// Mean interval expressed as beats per minute
    #[must_use]
    pub fn mean_heart_rate(&self) -> Option<f64> {
        self.mean()
            .filter(|mean| !mean.is_zero())
            .map(|mean| 60.0 / mean.as_secs_f64())
    }

    /// Forget every recorded interval
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.next = 0;
    }
}

impl Default for BeatIntervalWindow {
    fn default() -> Self {
        Self::new(MonitorConfig::DEFAULT_BEAT_WINDOW)
    }
}

/// Turns decoded samples into beats for [`BeatObserver`]s
///
/// The detector subscribes itself to its [`EcgSource`] when the first beat
/// observer is added and unsubscribes when the last one is removed, so the
/// device link follows the detector's audience.
pub struct BeatDetector {
    source: Arc<EcgSource>,
    shared: Arc<DetectorShared>,
    upstream: Arc<dyn SampleObserver>,
    lifecycle: tokio::sync::Mutex<()>,
}

struct DetectorShared {
    window: Mutex<WindowState>,
    observers: Mutex<Registry<dyn BeatObserver>>,
}

struct WindowState {
    intervals: BeatIntervalWindow,
    previous: Option<SystemTime>,
}

impl DetectorShared {
    fn dispatch(&self, source: &str, sample: &DecodedSample) {
        let beat = {
            let mut state = lock(&self.window);
            let interval = state
                .previous
                .and_then(|previous| sample.timestamp.duration_since(previous).ok());
            if let Some(interval) = interval {
                state.intervals.record(interval);
            }
            state.previous = Some(sample.timestamp);

            Beat {
                heart_rate_bpm: sample.heart_rate_bpm,
                timestamp: sample.timestamp,
                classification: BeatClass::Unclassified,
                interval,
                mean_heart_rate: state.intervals.mean_heart_rate(),
            }
        };

        for sub in lock(&self.observers).snapshot() {
            sub.observer.on_beat(source, &beat, sub.token);
        }
    }

    fn reset(&self) {
        let mut state = lock(&self.window);
        state.intervals.clear();
        state.previous = None;
    }
}

impl SampleObserver for DetectorShared {
    fn on_sample(&self, source: &str, sample: &DecodedSample, _token: Token) {
        self.dispatch(source, sample);
    }
}

impl BeatDetector {
    /// Token the detector registers itself with on its source
    pub const UPSTREAM_TOKEN: Token = Token(0);

    /// Create a detector averaging over the last `window` intervals
    pub fn new(source: Arc<EcgSource>, window: usize) -> Self {
        let shared = Arc::new(DetectorShared {
            window: Mutex::new(WindowState {
                intervals: BeatIntervalWindow::new(window),
                previous: None,
            }),
            observers: Mutex::new(Registry::new()),
        });
        let upstream: Arc<dyn SampleObserver> = shared.clone();

        Self {
            source,
            shared,
            upstream,
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Create a detector sized from the source's configuration
    pub fn from_source(source: Arc<EcgSource>) -> Self {
        let window = source.config().beat_window;
        Self::new(source, window)
    }

    /// Source the detector listens to
    #[must_use]
    pub const fn source(&self) -> &Arc<EcgSource> {
        &self.source
    }

    /// Number of live beat registrations
    #[must_use]
    pub fn observer_count(&self) -> usize {
        lock(&self.shared.observers).len()
    }

    /// Mean heart rate over the current interval window
    #[must_use]
    pub fn mean_heart_rate(&self) -> Option<f64> {
        lock(&self.shared.window).intervals.mean_heart_rate()
    }

    /// Feed one sample as if it came from the source
    ///
    /// Records the interval since the previous sample and dispatches the
    /// resulting beat to every observer in registration order.
    pub fn on_sample(&self, heart_rate_bpm: i32, timestamp: SystemTime) {
        let sample = DecodedSample::new(heart_rate_bpm, timestamp);
        let name = self.source.config().address().unwrap_or_default();
        self.shared.dispatch(name, &sample);
    }

    /// Register a beat observer
    ///
    /// The first registration subscribes the detector to its source, which
    /// connects to the device. If the device link has dropped since, the
    /// detector resubscribes and the source reconnects.
    ///
    /// # Errors
    ///
    /// Returns the source's connection error; nothing is registered then.
    pub async fn add_observer(&self, observer: Arc<dyn BeatObserver>, token: Token) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        let first = lock(&self.shared.observers).is_empty();
        if first || !self.source.is_connected().await {
            if !first {
                warn!("Device link lost, resubscribing beat detector");
                self.source
                    .remove_observer(Selector::Exact(&self.upstream), Selector::Any)
                    .await;
            }
            self.shared.reset();
            self.source
                .add_observer(Arc::clone(&self.upstream), Self::UPSTREAM_TOKEN)
                .await?;
            info!("Beat detector subscribed to {}", self.source.config().format);
        }

        lock(&self.shared.observers).add(observer, token);
        debug!("Beat observer {} registered", token);
        Ok(())
    }

    /// Remove every beat registration matching both selectors
    ///
    /// Removing the last one unsubscribes from the source. Returns the number
    /// of registrations removed.
    pub async fn remove_observer(
        &self,
        observer: Selector<&Arc<dyn BeatObserver>>,
        token: Selector<Token>,
    ) -> usize {
        let _guard = self.lifecycle.lock().await;

        let (removed, now_empty) = {
            let mut observers = lock(&self.shared.observers);
            let removed = observers.remove(observer, token);
            (removed, observers.is_empty())
        };

        if removed > 0 && now_empty {
            self.source
                .remove_observer(Selector::Exact(&self.upstream), Selector::Any)
                .await;
            self.shared.reset();
            info!("Beat detector unsubscribed");
        }

        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::HrError,
        protocol::encode_vendor_frame,
        transport::testing::{eventually, fast_config, ScriptedConnector},
        types::{ConnectionState, FrameFormat},
    };
    use tokio::io::AsyncWriteExt;

    type BeatLog = Arc<Mutex<Vec<(i32, Token)>>>;

    fn recorder(log: &BeatLog) -> Arc<dyn BeatObserver> {
        let log = Arc::clone(log);
        Arc::new(move |_: &str, beat: &Beat, token: Token| {
            assert_eq!(beat.classification, BeatClass::Unclassified);
            lock(&log).push((beat.heart_rate_bpm, token));
        })
    }

    fn source(connector: ScriptedConnector, address: &str) -> Arc<EcgSource> {
        let config = MonitorConfig {
            transport: fast_config(),
            ..MonitorConfig::new(address, FrameFormat::Vendor)
        };
        Arc::new(EcgSource::new(config, Arc::new(connector)))
    }

    #[test]
    fn test_window_mean_excludes_unset_slots() {
        let mut window = BeatIntervalWindow::new(4);
        assert!(window.is_empty());
        assert_eq!(window.mean(), None);
        assert_eq!(window.mean_heart_rate(), None);

        window.record(Duration::from_millis(1000));
        window.record(Duration::from_millis(500));

        assert_eq!(window.len(), 2);
        assert_eq!(window.mean(), Some(Duration::from_millis(750)));
        assert_eq!(window.mean_heart_rate(), Some(80.0));
    }

    #[test]
    fn test_window_overwrites_oldest() {
        let mut window = BeatIntervalWindow::new(2);
        window.record(Duration::from_secs(10));
        window.record(Duration::from_secs(1));
        window.record(Duration::from_secs(1));

        assert_eq!(window.len(), 2);
        assert_eq!(window.mean(), Some(Duration::from_secs(1)));

        window.clear();
        assert!(window.is_empty());
    }

    #[test]
    fn test_default_window_capacity() {
        assert_eq!(BeatIntervalWindow::default().capacity(), 20);
        assert_eq!(BeatIntervalWindow::new(0).capacity(), 1);
    }

    #[tokio::test]
    async fn test_beats_follow_samples() {
        let (connector, _device) = ScriptedConnector::accepting(1);
        let detector = BeatDetector::new(source(connector, "monitor"), 3);
        let log = BeatLog::default();
        detector.add_observer(recorder(&log), Token(1)).await.unwrap();
        detector.add_observer(recorder(&log), Token(2)).await.unwrap();

        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        detector.on_sample(60, start);
        assert_eq!(detector.mean_heart_rate(), None);

        detector.on_sample(60, start + Duration::from_secs(1));
        detector.on_sample(120, start + Duration::from_millis(1500));

        assert_eq!(detector.mean_heart_rate(), Some(80.0));
        assert_eq!(
            *lock(&log),
            vec![
                (60, Token(1)),
                (60, Token(2)),
                (60, Token(1)),
                (60, Token(2)),
                (120, Token(1)),
                (120, Token(2)),
            ]
        );

        detector.remove_observer(Selector::Any, Selector::Any).await;
    }

    #[tokio::test]
    async fn test_wildcard_token_removes_all_registrations() {
        let (connector, _device) = ScriptedConnector::accepting(1);
        let source = source(connector, "monitor");
        let detector = BeatDetector::new(Arc::clone(&source), 20);
        let log = BeatLog::default();
        let observer = recorder(&log);

        for token in 1..=3 {
            detector
                .add_observer(Arc::clone(&observer), Token(token))
                .await
                .unwrap();
        }
        assert_eq!(detector.observer_count(), 3);
        assert_eq!(source.observer_count(), 1);

        let removed = detector
            .remove_observer(Selector::Exact(&observer), Selector::Any)
            .await;

        assert_eq!(removed, 3);
        assert_eq!(detector.observer_count(), 0);
        assert_eq!(source.observer_count(), 0);
        assert_eq!(source.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_failed_connect_registers_nothing() {
        let detector = BeatDetector::new(source(ScriptedConnector::refusing(1), "monitor"), 20);
        let log = BeatLog::default();

        let result = detector.add_observer(recorder(&log), Token(1)).await;

        assert!(matches!(result, Err(HrError::DeviceUnavailable { .. })));
        assert_eq!(detector.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_unconfigured_source() {
        let (connector, _device) = ScriptedConnector::accepting(1);
        let detector = BeatDetector::new(source(connector, "  "), 20);
        let log = BeatLog::default();

        let result = detector.add_observer(recorder(&log), Token(1)).await;

        assert!(matches!(result, Err(HrError::NotConfigured)));
        assert_eq!(detector.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_add_after_link_loss_reconnects() {
        let (connector, devices) = ScriptedConnector::accepting_many(1, 2);
        let mut devices = devices.into_iter();
        let first = devices.next().unwrap();
        let mut second = devices.next().unwrap();
        let source = source(connector, "monitor");
        let detector = BeatDetector::new(Arc::clone(&source), 20);
        let log = BeatLog::default();

        detector.add_observer(recorder(&log), Token(1)).await.unwrap();
        assert!(source.is_connected().await);

        drop(first);
        tokio::time::timeout(
            Duration::from_secs(2),
            source.transport().wait_for_disconnect(),
        )
        .await
        .unwrap();
        assert_eq!(source.state().await, ConnectionState::Disconnected);

        detector.add_observer(recorder(&log), Token(2)).await.unwrap();
        assert_eq!(source.state().await, ConnectionState::Connected);
        assert_eq!(source.observer_count(), 1);

        second.write_all(&encode_vendor_frame(80)).await.unwrap();
        assert!(eventually(|| lock(&log).len() == 2).await);
        assert_eq!(*lock(&log), vec![(80, Token(1)), (80, Token(2))]);

        detector.remove_observer(Selector::Any, Selector::Any).await;
        assert_eq!(source.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_vendor_stream_to_beats() {
        let (connector, mut device) = ScriptedConnector::accepting(1);
        let detector = BeatDetector::from_source(source(connector, "monitor"));
        let log = BeatLog::default();
        detector.add_observer(recorder(&log), Token(7)).await.unwrap();

        device.write_all(&encode_vendor_frame(72)).await.unwrap();
        device.write_all(&encode_vendor_frame(300)).await.unwrap();
        device.write_all(&encode_vendor_frame(74)).await.unwrap();

        assert!(eventually(|| lock(&log).len() == 2).await);
        assert_eq!(*lock(&log), vec![(72, Token(7)), (74, Token(7))]);

        assert_eq!(detector.remove_observer(Selector::Any, Selector::Exact(Token(7))).await, 1);
        assert!(!detector.source().is_connected().await);
    }
}
