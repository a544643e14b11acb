use actix_web::{web, App, HttpServer};
use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use ipmap::api::{routes, AppState};
use ipmap::capture::backend::PcapBackend;
use ipmap::capture::context::PcapContext;
use ipmap::capture::filter::default_bpf_filter;
use ipmap::capture::manager::CaptureManager;
use ipmap::geo::coordinate::RangeTable;
use ipmap::geo::dns::ReverseDns;
use ipmap::models::config::{AppConfig, CaptureConfig};
use ipmap::utils::logging;

/// How often expired reverse DNS answers are dropped
const DNS_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[clap(author, version, about = "Live map of the hosts this machine talks to")]
struct Args {
    /// Network interface to capture from at startup
    #[clap(short, long)]
    interface: Option<String>,

    /// Port for the REST API server
    #[clap(short, long, default_value = "3000")]
    port: u16,

    /// Enable promiscuous mode
    #[clap(short = 'P', long)]
    promiscuous: bool,

    /// BPF filter expression, replacing the built-in one
    #[clap(long)]
    filter: Option<String>,

    /// Capture everything the device sees
    #[clap(long, conflicts_with = "filter")]
    no_default_filter: bool,

    /// Reporting period in milliseconds
    #[clap(long, default_value = "150")]
    report_ms: u64,

    /// Idle time before a flow is ended, in milliseconds
    #[clap(long, default_value = "5000")]
    timeout_ms: u64,

    /// Time constant of the throughput average, in milliseconds
    #[clap(long, default_value = "1000")]
    rate_window_ms: u64,

    /// Maximum number of tracked flows
    #[clap(long, default_value = "4096")]
    max_flows: usize,

    /// Up/down rate ratio above which a flow counts as mixed
    #[clap(long, default_value = "0.7")]
    mixed_ratio: f64,

    /// Bytes captured per frame
    #[clap(long, default_value = "128")]
    snaplen: i32,

    /// Ignore remotes that are not globally routable
    #[clap(long)]
    skip_non_global: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[clap(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> AppConfig {
        let filter = if self.no_default_filter {
            None
        } else {
            Some(self.filter.unwrap_or_else(default_bpf_filter))
        };

        AppConfig {
            interface: self.interface,
            port: self.port,
            log_level: self.log_level,
            capture: CaptureConfig {
                report_frequency: Duration::from_millis(self.report_ms),
                connection_timeout: Duration::from_millis(self.timeout_ms),
                rate_window: Duration::from_millis(self.rate_window_ms),
                max_flows: self.max_flows,
                mixed_ratio: self.mixed_ratio,
                snaplen: self.snaplen,
                promiscuous: self.promiscuous,
                filter,
                skip_non_global: self.skip_non_global,
            },
        }
    }
}

#[actix_web::main]
async fn main() -> Result<()> {
    let config = Args::parse().into_config();

    logging::init_logger(logging::get_log_level(&config.log_level));

    info!("Starting ipmap v{}", env!("CARGO_PKG_VERSION"));

    let context = PcapContext::init(Arc::new(PcapBackend::new()));
    if context.state().available && !context.has_capture_privilege() {
        warn!("ipmap is not running with packet capture privileges.");
        #[cfg(target_os = "windows")]
        warn!("Right-click and select 'Run as administrator' for full functionality.");
        #[cfg(not(target_os = "windows"))]
        warn!("Run as root or grant CAP_NET_RAW for full functionality.");
    }

    let manager = CaptureManager::attach(context.clone(), config.capture.clone()).await?;
    if let Some(interface) = &config.interface {
        if let Err(e) = manager.start_capture(interface).await {
            warn!("Could not start capture on {}: {}", interface, e);
        }
    }

    let port = config.port;
    let app_state = web::Data::new(AppState {
        context: context.clone(),
        manager: RwLock::new(manager),
        config,
        resolver: Arc::new(RangeTable::new()),
        dns: ReverseDns::new(),
    });

    {
        let state = app_state.clone();
        actix_web::rt::spawn(async move {
            let mut purge = tokio::time::interval(DNS_PURGE_INTERVAL);
            loop {
                purge.tick().await;
                state.dns.purge_expired();
            }
        });
    }

    info!("Starting ipmap API server on port {}", port);

    HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .configure(routes::configure)
    })
    .bind(("127.0.0.1", port))?
    .run()
    .await?;

    context.shutdown();
    info!("Shut down");
    Ok(())
}
