//! Consume analysis jobs from the broker and fan them out to enrichers.
use std::future::ready;
use std::path::PathBuf;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;

use zoo_common::liveness::Liveness;
use zoo_common::metrics::{serve, setup_metrics_routes};
use zoo_dispatcher::broker;
use zoo_dispatcher::config::Settings;
use zoo_dispatcher::dispatch::Dispatcher;
use zoo_dispatcher::error::DispatcherError;
use zoo_dispatcher::publish::Publisher;

#[derive(Parser, Debug)]
#[command(version, about = "Distributed file-analysis dispatcher")]
struct Cli {
    /// Path to a configuration file overriding the built-in defaults.
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), DispatcherError> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    let zoo = settings.zoo;

    let liveness = Liveness::new("liveness");
    let dispatcher_beat = liveness.register("dispatcher", time::Duration::seconds(60));

    // An unreachable broker at startup is unrecoverable; the `?` turns it
    // into a non-zero exit.
    let connection = broker::connect(&zoo.rabbit_settings.host).await?;
    let consume_channel = connection.create_channel().await?;
    let publish_channel = connection.create_channel().await?;

    let (outbound_tx, outbound_rx) = mpsc::channel(64);
    let publisher = Publisher::new(publish_channel, &zoo, outbound_rx);
    tokio::spawn(publisher.run());

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.status())));
    let router = setup_metrics_routes(router);
    let bind = zoo.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    info!("zoo dispatcher starting");
    let dispatcher = Dispatcher::new(consume_channel, zoo, outbound_tx, dispatcher_beat);
    dispatcher.run().await
}

pub async fn index() -> &'static str {
    "zoo dispatcher"
}
