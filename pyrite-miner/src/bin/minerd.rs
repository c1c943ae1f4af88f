use std::sync::Arc;

use tokio::signal::unix::{self, SignalKind};

use pyrite_miner::asic::{DeviceFamily, ZeusFamily};
use pyrite_miner::config::Settings;
use pyrite_miner::device::{DeviceDriver, SerialLink};
use pyrite_miner::pool::LogSink;
use pyrite_miner::tracing::{self, prelude::*};
use pyrite_miner::work::Work;

/// A throwaway job for bring-up, so a freshly attached board has
/// something to chew on before a pool client is wired in.
fn bringup_work() -> Work {
    Work {
        job_id: "bringup".to_string(),
        header: vec![0u8; 76],
        difficulty: 32,
        starting_nonce: 0,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init();

    let settings_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "devices.json".to_string());
    let settings = Settings::load(&settings_path)?;
    anyhow::ensure!(
        !settings.devices.is_empty(),
        "{settings_path} configures no devices"
    );

    let sink: Arc<dyn pyrite_miner::pool::WorkSubmissionSink> = Arc::new(LogSink);
    let mut drivers = Vec::new();
    for config in settings.devices {
        let family = ZeusFamily::new(config.clock, config.cores);
        let link = SerialLink::new(&config.port, family.baud_rate());
        let driver = DeviceDriver::new(
            config,
            Box::new(family),
            Arc::new(link),
            Arc::clone(&sink),
        )?;
        driver.load()?;
        driver.start_work(bringup_work())?;
        drivers.push(driver);
    }
    info!(devices = drivers.len(), "Started.");

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }

    trace!("Shutting down.");
    for driver in &drivers {
        driver.unload().await;
    }
    info!("Exiting.");
    Ok(())
}
