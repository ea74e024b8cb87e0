use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info};

mod capture;
mod clock;
mod config;
mod decoder;
mod error;
mod lifecycle;
mod queue;
mod reporter;
mod stats;

use capture::{CaptureEngine, PacketSource, PnetSource};
use config::Config;
use error::AppError;
use lifecycle::{LifecycleState, State};
use queue::EventQueue;
use reporter::Reporter;
use stats::Aggregator;

const EVENT_QUEUE_CAPACITY: usize = 4096;

fn run() -> Result<(), AppError> {
    let config = Config::from_args()?;

    info!(
        "starting memkeys-observer on interface {} port {}",
        config.interface, config.port
    );

    let queue = Arc::new(EventQueue::new(EVENT_QUEUE_CAPACITY));

    let mut capture = CaptureEngine::new(queue.clone());
    let decoder_cfg = decoder::DecoderConfig::new(config.port);
    let interface = config.interface.clone();
    capture.start(decoder_cfg, move || {
        PnetSource::open(&interface)
            .map(|s| Box::new(s) as Box<dyn PacketSource>)
    })?;

    let mut aggregator = Aggregator::new(queue, config.discard_threshold);
    aggregator.start();

    let run_state = Arc::new(LifecycleState::new());
    run_state.check_and_set(State::New, State::Running);

    let ctrlc_state = run_state.clone();
    ctrlc::set_handler(move || {
        info!("received interrupt signal, shutting down");
        ctrlc_state.check_and_set(State::Running, State::Stopping);
    })
    .map_err(|e| AppError::Config(format!("failed to install signal handler: {}", e)))?;

    let reporter = Reporter::new(&config);
    reporter.run(&aggregator, &run_state);

    info!("shutting down capture and aggregation threads...");
    capture.shutdown();
    aggregator.shutdown();
    info!("shutdown complete");

    Ok(())
}

fn main() -> ExitCode {
    env_logger::builder()
        .format_timestamp_millis()
        .filter_module("memkeys_observer::capture", log::LevelFilter::Debug)
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ AppError::Config(_)) => {
            error!("{}", e);
            ExitCode::from(2)
        }
        Err(e @ AppError::Capture(_)) => {
            error!("{}", e);
            ExitCode::from(3)
        }
    }
}
