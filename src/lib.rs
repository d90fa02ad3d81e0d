#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # hrstream
//!
//! Heart-rate data acquisition for wireless ECG monitors that stream over a
//! serial-style link.
//!
//! The crate connects to a monitor, decodes its byte stream and hands
//! decoded data to registered observers:
//!
//! - **Transport**: probes serial channels 1..=30 on the device address until
//!   one accepts, then polls the link from a background task with a bounded
//!   read timeout and cooperative shutdown
//! - **Decoding**: two wire formats. Chunked streams carry sync-marked chunks of
//!   ECG and accelerometer blocks with an 8-bit checksum; vendor streams carry
//!   fixed 93-byte `FRWD` frames with the heart rate in doubled ASCII digits.
//!   Corruption is recovered by resynchronising on the next sync mark and is
//!   never fatal to the session
//! - **Observers**: [`EcgSource`] and [`BeatDetector`] connect when the first
//!   observer registers and disconnect, discarding all decode state, when the
//!   last one is removed
//!
//! ## Quick Start
//!
//! ```no_run
//! use hrstream::{Beat, BeatDetector, EcgSource, FrameFormat, MonitorConfig, TcpConnector, Token};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MonitorConfig::new("192.168.1.40", FrameFormat::Vendor);
//!     let source = Arc::new(EcgSource::new(config, Arc::new(TcpConnector::new(7000))));
//!     let detector = BeatDetector::from_source(source);
//!
//!     // Connects to the monitor
//!     detector
//!         .add_observer(
//!             Arc::new(|source: &str, beat: &Beat, _: Token| {
//!                 println!("{source}: {} bpm", beat.heart_rate_bpm);
//!             }),
//!             Token(1),
//!         )
//!         .await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(30)).await;
//!
//!     // Disconnects again
//!     detector
//!         .remove_observer(hrstream::Selector::Any, hrstream::Selector::Any)
//!         .await;
//!     Ok(())
//! }
//! ```

/// Beat detection over decoded samples
pub mod beat;
/// Bluetooth Low Energy serial connector
#[cfg(feature = "ble")]
pub mod ble;
/// Streaming decoders for the supported wire formats
pub mod decoder;
/// Error types and handling
pub mod error;
/// Byte FIFO with checksum accumulation and sync-mark search
pub mod frame;
/// Observer traits and registration bookkeeping
pub mod observer;
/// Wire format structures, parsing and encoding
pub mod protocol;
/// Decoder-layer facade owning transport and decoder
pub mod source;
/// Channel-probing transport and link abstraction
pub mod transport;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use beat::{BeatDetector, BeatIntervalWindow};
#[cfg(feature = "ble")]
pub use ble::BleConnector;
pub use decoder::{decoder_for, ChunkDecoder, Decoded, DecoderStats, StreamDecoder, VendorDecoder};
pub use error::{HrError, Result};
pub use observer::{BeatObserver, SampleObserver, Selector, Token};
pub use source::EcgSource;
pub use transport::{ByteSink, ChannelError, Connector, Link, StreamLink, TcpConnector, Transport};
pub use types::{
    AccelerometerAxes, Beat, BeatClass, Chunk, ChunkHeader, ConnectionState, DataBlock,
    DecodedSample, FrameFormat, MonitorConfig, SampleRate, TransportConfig, HEART_RATE_UNKNOWN,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
