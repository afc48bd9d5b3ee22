use log::LevelFilter;
use std::str::FromStr;

/// Install the global `fern` logger.
///
/// `level` is any `log` level name ("info", "debug", ...); unknown names fall back to info.
/// When `file` is given, records are duplicated into it.
pub fn init_logging(level: &str, file: Option<&str>) -> Result<(), fern::InitError> {
    let level = LevelFilter::from_str(level).unwrap_or(LevelFilter::Info);

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] {}: {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        // reqwest/hyper/tungstenite chatter drowns the gateway's own lines
        .level_for("hyper", LevelFilter::Warn)
        .level_for("reqwest", LevelFilter::Warn)
        .level_for("tungstenite", LevelFilter::Warn)
        .level_for("tokio_tungstenite", LevelFilter::Warn)
        .chain(std::io::stdout());

    if let Some(path) = file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}

/// `info!` that is skipped when the owning adapter runs in silent mode.
/// Warnings and errors must keep using `warn!`/`error!` directly.
#[macro_export]
macro_rules! quiet_info {
    ($silent:expr, $($arg:tt)+) => {
        if !$silent {
            log::info!($($arg)+);
        }
    };
}
