use bytes::Bytes;
use hrstream::{
    decoder_for,
    protocol::{encode_chunk, encode_vendor_frame},
    ChunkHeader, DataBlock, Decoded, FrameFormat, Result, SampleRate,
};
use std::time::SystemTime;
use tracing::{info, warn};

/// Usage: replay_capture [capture-file] [chunked|vendor]
///
/// Without a capture file a short synthetic stream is decoded instead.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let path = args.next();
    let format = match args.next().as_deref() {
        Some("vendor") => FrameFormat::Vendor,
        _ => FrameFormat::Chunked,
    };

    let capture = match path {
        Some(path) => Bytes::from(tokio::fs::read(&path).await?),
        None => {
            info!("No capture given, replaying a synthetic {} stream", format);
            synthetic(format)
        }
    };

    let mut decoder = decoder_for(format);
    info!("🔁 Replaying {} bytes through the {} decoder", capture.len(), decoder.name());

    // Feed in uneven slices like a radio link would deliver them
    for piece in capture.chunks(37) {
        for unit in decoder.push(piece, SystemTime::now()) {
            match unit {
                Decoded::Chunk(chunk) => {
                    if let Some(expected) = chunk.gap_from {
                        warn!("Chunks lost before {} (expected {})", chunk.header.sequence, expected);
                    }
                    info!(
                        "Chunk {} battery {}% with {} blocks",
                        chunk.header.sequence,
                        chunk.header.battery_level,
                        chunk.blocks.len()
                    );
                }
                Decoded::Sample(sample) => info!("Heart rate {} bpm", sample.heart_rate_bpm),
            }
        }
    }

    let stats = decoder.stats();
    info!("📊 {:?}", stats);
    Ok(())
}

fn synthetic(format: FrameFormat) -> Bytes {
    let mut stream = Vec::new();
    match format {
        FrameFormat::Vendor => {
            for bpm in [64, 66, 250, 65] {
                stream.extend_from_slice(&encode_vendor_frame(bpm));
            }
        }
        FrameFormat::Chunked => {
            for sequence in [4094, 4095, 0, 2] {
                let header = ChunkHeader {
                    battery_level: 90,
                    sequence,
                    event: false,
                    block_count: 0,
                };
                let block = DataBlock::Ecg {
                    sample_rate: SampleRate::Hz300,
                    voltages: Bytes::from_static(&[0x80, 0x84, 0x9A, 0x7C, 0x80]),
                };
                stream.extend_from_slice(&encode_chunk(header, &[block]));
                stream.extend_from_slice(b"noise");
            }
        }
    }
    Bytes::from(stream)
}
