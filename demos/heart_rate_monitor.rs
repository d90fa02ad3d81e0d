use hrstream::{
    Beat, BeatDetector, EcgSource, FrameFormat, MonitorConfig, Result, Selector, TcpConnector,
    Token,
};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Usage: heart_rate_monitor <address> [port-base] [chunked|vendor]
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let address = args.next().unwrap_or_default();
    let port_base = args.next().and_then(|p| p.parse().ok()).unwrap_or(7000);
    let format = match args.next().as_deref() {
        Some("chunked") => FrameFormat::Chunked,
        _ => FrameFormat::Vendor,
    };

    info!("💓 hrstream heart rate monitor");
    info!("Device {:?}, {} frames, ports from {}", address, format, port_base);

    let config = MonitorConfig::new(address, format);
    let source = Arc::new(EcgSource::new(config, Arc::new(TcpConnector::new(port_base))));
    let detector = BeatDetector::from_source(Arc::clone(&source));

    let printer = Arc::new(|source: &str, beat: &Beat, _: Token| match beat.mean_heart_rate {
        Some(mean) => info!("{}: {} bpm (mean {:.1})", source, beat.heart_rate_bpm, mean),
        None => info!("{}: {} bpm", source, beat.heart_rate_bpm),
    });

    if let Err(e) = detector.add_observer(printer, Token(1)).await {
        error!("❌ Failed to start monitoring: {}", e);
        if e.is_recoverable() {
            warn!("Check that the monitor is switched on and in range");
        }
        return Err(e);
    }

    info!("✅ Streaming, press Ctrl+C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    }

    detector.remove_observer(Selector::Any, Selector::Any).await;

    let stats = source.stats();
    info!(
        "Session over: {} frames, {} readings rejected, {} resyncs",
        stats.frames, stats.rejected_readings, stats.resyncs
    );
    Ok(())
}
