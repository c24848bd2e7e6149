use depthsync_rs::bridge::{FrameBridge, MonotonicClock};
use depthsync_rs::config::{Config, ExchangeKind};
use depthsync_rs::producer::{Output, ProducerHost};
use depthsync_rs::sequence::HttpSnapshotSource;
use depthsync_rs::Store;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = Config {
        exchange: ExchangeKind::Spot,
        ..Config::default()
    };
    let endpoints = config.exchange.endpoints();
    let source = HttpSnapshotSource::new(endpoints.rest_url);

    let (output_tx, mut output_rx) = tokio::sync::mpsc::unbounded_channel();
    let host = ProducerHost::new(
        config.exchange.stream_url(),
        source,
        endpoints.symbol,
        config.depth,
        output_tx,
    );

    let store = Store::new();
    let mut bridge = FrameBridge::new(MonotonicClock::default());

    tokio::spawn(host.run());

    let mut tick = tokio::time::interval(std::time::Duration::from_millis(16));
    loop {
        tokio::select! {
            Some(output) = output_rx.recv() => match output {
                Output::OrderbookUpdate { data, .. } => bridge.on_slice(data),
                Output::StatusChange { status, .. } => {
                    tracing::info!("status: {:?}", status);
                    store.set_status(status);
                }
            },
            _ = tick.tick() => {
                if let Some(metrics) = bridge.tick(&store) {
                    tracing::info!("metrics: {:?}", metrics);
                }
                if let Some(slice) = store.live_slice() {
                    tracing::info!(
                        "best bid {:?} best ask {:?} spread {}",
                        slice.best_bid(),
                        slice.best_ask(),
                        slice.spread
                    );
                }
            }
        }
    }
}
