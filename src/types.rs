use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    time::{Duration, SystemTime},
};

/// Heart rate reported before enough data exists to compute one
pub const HEART_RATE_UNKNOWN: i32 = -1;

/// Transport connection state
///
/// Transitions are driven both by the caller (connect, disconnect request) and
/// by the background poll task (disconnecting, disconnected), so the value is
/// only ever touched under a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No link to the device
    #[default]
    Disconnected,
    /// Probing channels
    Connecting,
    /// Link established and poll task running
    Connected,
    /// Caller asked the poll task to stop
    DisconnectRequested,
    /// Poll task is closing the link
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::DisconnectRequested => write!(f, "Disconnect Requested"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// ECG sampling rate announced by an ECG block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleRate {
    /// 150 samples per second
    Hz150,
    /// 300 samples per second
    Hz300,
}

impl SampleRate {
    /// Map the wire code to a sample rate
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::Hz150),
            0x02 => Some(Self::Hz300),
            _ => None,
        }
    }

    /// Wire code for this rate
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Hz150 => 0x01,
            Self::Hz300 => 0x02,
        }
    }

    /// Samples per second
    #[must_use]
    pub const fn hz(self) -> u16 {
        match self {
            Self::Hz150 => 150,
            Self::Hz300 => 300,
        }
    }
}

impl fmt::Display for SampleRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz", self.hz())
    }
}

/// Accelerometer block layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccelerometerAxes {
    /// Two-axis samples
    Two,
    /// Three-axis samples
    Three,
}

impl AccelerometerAxes {
    /// Number of axes
    #[must_use]
    pub const fn count(self) -> u8 {
        match self {
            Self::Two => 2,
            Self::Three => 3,
        }
    }
}

/// Decoded 6-byte chunk header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHeader {
    /// Battery charge in percent
    pub battery_level: u8,
    /// 12-bit sequence number, wraps at 4096
    pub sequence: u16,
    /// Event button flag. The device gives no reliable event timing.
    pub event: bool,
    /// Number of data blocks following the header
    pub block_count: u8,
}

/// One data block carried inside a chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataBlock {
    /// ECG voltage samples
    Ecg {
        /// Announced sampling rate
        sample_rate: SampleRate,
        /// Raw voltage bytes
        voltages: Bytes,
    },
    /// Accelerometer samples, validated but not interpreted
    Accelerometer {
        /// Axis layout
        axes: AccelerometerAxes,
        /// Raw payload after the block header
        raw: Bytes,
    },
}

/// A chunk whose checksum has been verified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Chunk header
    pub header: ChunkHeader,
    /// Blocks in wire order
    pub blocks: Vec<DataBlock>,
    /// Sequence number that was expected instead, if chunks were dropped
    pub gap_from: Option<u16>,
}

/// Heart-rate reading handed to sample observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedSample {
    /// Beats per minute, [`HEART_RATE_UNKNOWN`] when not yet computable
    pub heart_rate_bpm: i32,
    /// Time the reading was decoded
    pub timestamp: SystemTime,
}

impl DecodedSample {
    /// Create a sample
    #[must_use]
    pub const fn new(heart_rate_bpm: i32, timestamp: SystemTime) -> Self {
        Self {
            heart_rate_bpm,
            timestamp,
        }
    }

    /// Whether a heart rate is available
    #[must_use]
    pub const fn is_known(&self) -> bool {
        self.heart_rate_bpm != HEART_RATE_UNKNOWN
    }
}

/// Beat classification tag
///
/// No beat morphology analysis is performed, every beat carries the same tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub enum BeatClass {
    /// Not classified
    #[default]
    Unclassified,
}

impl fmt::Display for BeatClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unclassified => write!(f, "Unclassified"),
        }
    }
}

/// Beat delivered to beat observers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Beat {
    /// Heart rate from the sample that produced this beat
    pub heart_rate_bpm: i32,
    /// Sample timestamp
    pub timestamp: SystemTime,
    /// Classification tag
    pub classification: BeatClass,
    /// Interval since the previous sample
    pub interval: Option<Duration>,
    /// Mean heart rate over the interval window
    pub mean_heart_rate: Option<f64>,
}

/// Wire format spoken by the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FrameFormat {
    /// Sync-marked chunks of ECG/accelerometer blocks with a checksum
    #[default]
    Chunked,
    /// Fixed 93-byte `FRWD` frames with an encoded heart rate
    Vendor,
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chunked => write!(f, "chunked"),
            Self::Vendor => write!(f, "vendor"),
        }
    }
}

/// Transport timing and probing parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// First channel tried when connecting
    pub first_channel: u8,
    /// Last channel tried when connecting
    pub last_channel: u8,
    /// Longest the poll task blocks waiting for data, in milliseconds
    pub poll_timeout_ms: u64,
    /// Sleep between state checks while waiting for disconnect, in milliseconds
    pub disconnect_poll_interval_ms: u64,
    /// Size of the read buffer used by the poll task
    pub read_buffer_size: usize,
}

impl TransportConfig {
    /// Poll timeout as a [`Duration`]
    #[must_use]
    pub const fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Disconnect poll interval as a [`Duration`]
    #[must_use]
    pub const fn disconnect_poll_interval(&self) -> Duration {
        Duration::from_millis(self.disconnect_poll_interval_ms)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            first_channel: 1,
            last_channel: 30,
            poll_timeout_ms: 15_000,
            disconnect_poll_interval_ms: 1_000,
            read_buffer_size: 1024,
        }
    }
}

/// Monitor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Device address, `None` or empty when not configured
    pub device_address: Option<String>,
    /// Wire format spoken by the device
    pub format: FrameFormat,
    /// Transport parameters
    pub transport: TransportConfig,
    /// Number of beat intervals averaged by the beat detector
    pub beat_window: usize,
}

impl MonitorConfig {
    /// Default beat interval window size
    pub const DEFAULT_BEAT_WINDOW: usize = 20;

    /// Create a configuration for the given address with defaults elsewhere
    #[must_use]
    pub fn new(device_address: impl Into<String>, format: FrameFormat) -> Self {
        Self {
            device_address: Some(device_address.into()),
            format,
            transport: TransportConfig::default(),
            beat_window: Self::DEFAULT_BEAT_WINDOW,
        }
    }

    /// The configured address, ignoring empty strings
    #[must_use]
    pub fn address(&self) -> Option<&str> {
        self.device_address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            device_address: None,
            format: FrameFormat::default(),
            transport: TransportConfig::default(),
            beat_window: Self::DEFAULT_BEAT_WINDOW,
        }
    }
}
