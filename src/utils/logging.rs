use env_logger::{Builder, Env};
use log::LevelFilter;
use std::io::Write;

/// Initialize the logger; `RUST_LOG`, when set, takes precedence over `level`
pub fn init_logger(level: LevelFilter) {
    let mut builder = Builder::new();

    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .filter(None, level)
        // actix's per-request logging is noise at info level
        .filter(Some("actix_server"), LevelFilter::Warn.min(level))
        .parse_env(Env::default());

    // try_init: tests and the probe binary may initialize more than once
    let _ = builder.try_init();
}

/// Get log level from string
pub fn get_log_level(level: &str) -> LevelFilter {
    level.trim().parse().unwrap_or(LevelFilter::Info)
}
