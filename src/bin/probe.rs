use anyhow::{anyhow, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

use ipmap::capture::backend::PcapBackend;
use ipmap::capture::context::PcapContext;
use ipmap::capture::manager::CaptureManager;
use ipmap::models::config::CaptureConfig;
use ipmap::utils::logging;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Checks that packet capture works on this system")]
struct Args {
    /// Interface to test; defaults to the preferred one
    interface: Option<String>,

    /// Capture for this many seconds, printing each delta
    #[clap(short, long, default_value = "0")]
    seconds: u64,

    /// Log level (trace, debug, info, warn, error, off)
    #[clap(long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init_logger(logging::get_log_level(&args.log_level));

    println!("ipmap capture probe");

    let context = PcapContext::init(Arc::new(PcapBackend::new()));
    let state = context.state();
    if !state.available {
        let reason = state.error.map(|e| e.to_string()).unwrap_or_default();
        return Err(anyhow!("packet capture unavailable: {}", reason));
    }
    println!("Backend: {}", state.version.as_deref().unwrap_or("libpcap"));
    println!("Capture privilege: {}", if context.has_capture_privilege() { "yes" } else { "no" });

    let manager = CaptureManager::attach(context.clone(), CaptureConfig::default()).await?;
    let devices = manager.enumerate_devices()?;
    if devices.is_empty() {
        return Err(anyhow!("no capture devices found"));
    }

    println!("Devices:");
    for device in &devices {
        let addresses: Vec<String> = device.addresses.iter().map(|a| a.to_string()).collect();
        println!(
            "  {}{} [{}{}] {}",
            if device.is_preferred { "* " } else { "  " },
            device.display_name(),
            if device.ready { "up" } else { "down" },
            if device.wireless { ", wireless" } else { "" },
            addresses.join(", ")
        );
    }

    if args.seconds == 0 {
        return Ok(());
    }

    let interface = match args.interface {
        Some(interface) => interface,
        None => devices[0].name.clone(),
    };

    manager.on_delta(|delta| {
        println!(
            "+{} -{} active={} max={:.0} B/s up={} B down={} B{}",
            delta.started.len(),
            delta.ended.len(),
            delta.updated.len(),
            delta.max_throughput,
            delta.session.up_total,
            delta.session.down_total,
            if delta.is_final { " (final)" } else { "" }
        );
    });

    println!("Capturing on {} for {}s", interface, args.seconds);
    manager.start_capture(&interface).await?;
    tokio::time::sleep(Duration::from_secs(args.seconds)).await;
    manager.stop_capture().await?;

    if let Some(e) = manager.current_state().error {
        return Err(anyhow!("capture failed: {}", e));
    }
    println!("Probe completed successfully");
    Ok(())
}
