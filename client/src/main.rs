use std::{process::ExitCode, sync::Arc};

use client::{ClientConfig, ClientErr, ClientSession, RoundLoop, RoundStats, net::TcpConnector};
use engine::{InMemoryDataset, LinearEngine, ParameterCodec};
use log::{error, info};
use tokio::{signal, sync::watch};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let ClientErr::TransportExhausted { stats, .. } = &e {
                report(stats, "transport exhausted");
            }
            error!("client failed: {e}");
            log::logger().flush();
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), ClientErr> {
    let cfg = ClientConfig::load()?;
    let client_id = cfg.client_id();

    let dataset = match &cfg.dataset_path {
        Some(path) => InMemoryDataset::from_csv(path)?,
        None => InMemoryDataset::synthetic(
            cfg.synthetic.samples,
            cfg.synthetic.features,
            cfg.synthetic.seed,
        )?,
    };
    info!(
        client_id = client_id.as_str(),
        samples = dataset.len(),
        features = dataset.features();
        "local dataset ready"
    );

    let engine = LinearEngine::new(Arc::new(dataset));
    let initial = engine.initial_state(cfg.dtype());
    let codec = ParameterCodec::new(engine.layout(), cfg.dtype());

    let session = ClientSession::new(client_id, codec, initial, engine.clone(), engine)
        .map_err(|e| ClientErr::Config(format!("initial model does not fit the codec: {e}")))?;

    let connector =
        TcpConnector::new(cfg.coordinator_addr.clone()).with_max_frame_len(cfg.max_frame_len);
    info!(addr = cfg.coordinator_addr.as_str(); "starting round loop");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("received SIGINT, finishing the current round");
            let _ = shutdown_tx.send(true);
        }
    });

    let (stats, termination) = RoundLoop::new(Arc::new(session), connector, cfg.loop_config())
        .with_shutdown(shutdown_rx)
        .run()
        .await?;

    report(&stats, &format!("{termination:?}"));
    Ok(())
}

fn report(stats: &RoundStats, outcome: &str) {
    info!(
        rounds = stats.rounds,
        fit = stats.fit_rounds,
        evaluate = stats.evaluate_rounds,
        failed = stats.failed_rounds,
        samples = stats.samples,
        transport_failures = stats.transport_failures,
        reconnects = stats.reconnects;
        "wrapping up: {outcome}"
    );
}
