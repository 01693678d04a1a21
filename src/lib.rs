//! `nano-detect` - BLE camera client for a person-detection board
//!
//! The camera streams a grayscale frame and a detection score as BLE
//! notifications. This crate reassembles the fragments into a frame and
//! score, uploads the frame as PNG and forwards the detection flag.

pub mod capture;
pub mod config;
pub mod driver;
pub mod frame_assembler;
pub mod frame_validation;
pub mod gray_frame;
pub mod replay;
pub mod session;
pub mod sinks;
pub mod test_utils;
pub mod transport;

use anyhow::Context;
use std::io::{BufRead, Write};
use std::path::Path;

use crate::config::AppConfig;
use crate::driver::CaptureDriver;
use crate::replay::{ReplayConfig, ReplayTransport};
use crate::sinks::{DetectionSink, HttpSink, LocalStore, UploadSink};
use crate::test_utils::MockTransport;
use crate::transport::Transport;

/// Run the `nano-detect` client
///
/// Initializes logging, loads configuration and runs capture cycles on
/// request from stdin until `q` or end of input. Cycle failures are logged
/// and the prompt returns.
///
/// # Errors
///
/// Returns an error if configuration, the sink, the replay file or the
/// async runtime cannot be set up.
pub fn run() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("nano-detect starting up");

    let config = AppConfig::load().context("failed to load configuration")?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build async runtime")?;

    match config.base_url.clone() {
        Some(url) => {
            let sink = HttpSink::new(&url, config.upload_timeout())
                .with_context(|| format!("failed to create client for {}", url))?;
            log::info!("Delivering to {}", sink.base_url());
            start(&runtime, config, sink)
        }
        None => {
            let store = LocalStore::new(&config.store_dir, &config.image_filename)
                .with_context(|| format!("failed to open store {}", config.store_dir.display()))?;
            log::info!("Images are stored at {}", store.image_path().display());
            start(&runtime, config, store)
        }
    }
}

/// Load a recording for live replay and switch `config` to its geometry.
///
/// # Errors
///
/// Returns an error if the recording cannot be read or its geometry is
/// invalid.
pub fn replay_transport(path: &Path, config: &mut AppConfig) -> anyhow::Result<ReplayTransport> {
    let transport = ReplayTransport::load(path, ReplayConfig::default())
        .with_context(|| format!("failed to load replay {}", path.display()))?;
    transport
        .apply_geometry(config)
        .with_context(|| format!("unusable replay {}", path.display()))?;
    log::info!(
        "Replaying {} fragments from {}",
        transport.replay().packet_count(),
        path.display()
    );
    Ok(transport)
}

fn start<S>(runtime: &tokio::runtime::Runtime, mut config: AppConfig, sink: S) -> anyhow::Result<()>
where
    S: UploadSink + DetectionSink + Clone,
{
    match config.replay_path.clone() {
        Some(path) => {
            let transport = replay_transport(&path, &mut config)?;
            let driver = CaptureDriver::new(config, transport, sink.clone(), sink)?;
            prompt_loop(runtime, driver)
        }
        None => {
            log::warn!("No radio backend configured, using the synthetic camera");
            let transport = MockTransport::synthetic_camera(&config);
            let driver = CaptureDriver::new(config, transport, sink.clone(), sink)?;
            prompt_loop(runtime, driver)
        }
    }
}

fn prompt_loop<T, U, D>(
    runtime: &tokio::runtime::Runtime,
    mut driver: CaptureDriver<T, U, D>,
) -> anyhow::Result<()>
where
    T: Transport,
    U: UploadSink,
    D: DetectionSink,
{
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        print!("Enter 1 to take a picture (q to quit): ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next() else {
            break;
        };

        match line?.trim() {
            "1" => match runtime.block_on(driver.run_cycle()) {
                Ok(report) => log::info!(
                    "Cycle {} complete: score {}, detected {}",
                    driver.cycles_completed(),
                    report.score.value(),
                    report.detected
                ),
                Err(e) => log::error!("Cycle failed: {}", e),
            },
            "q" | "quit" => break,
            "" => {}
            other => log::warn!("Unknown command {:?}", other),
        }
    }

    log::info!("nano-detect shutting down");
    Ok(())
}
