use anyhow::Context;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Plain,
    Json,
}

impl LogFormat {
    pub fn from_config(s: &str) -> anyhow::Result<LogFormat> {
        use LogFormat::*;
        match s {
            "plain" => Ok(Plain),
            "json" => Ok(Json),
            _ => anyhow::bail!("Unrecognized log format. Please specify 'plain' or 'json'."),
        }
    }
}

/// Initialize logging to stderr, using the given log format.
///
/// The RUST_LOG environment variable selects the filter, defaulting to `info`.
pub fn init(log_format: LogFormat) -> anyhow::Result<()> {
    let default_filter_str = "info";

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter_str));

    let base_logger = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Json => base_logger.json().init(),
        LogFormat::Plain => base_logger.init(),
    }

    Ok(())
}

/// Initialize a logger suitable for unit tests: plain format, respecting
/// RUST_LOG, ignoring double-init from concurrent tests.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Replace the default panic hook with one that logs through tracing before
/// aborting, so panics land in the same sink as everything else.
pub fn replace_panic_hook_with_tracing_panic_hook() -> anyhow::Result<()> {
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "<unknown>".to_string());
        tracing::error!("panic at {location}: {info}");
    }));
    Ok(())
}

/// Flush and exit with the given error, used by binaries for startup errors.
pub fn exit_with_error(err: anyhow::Error) -> ! {
    tracing::error!("{err:?}");
    std::process::exit(1);
}

pub fn parse_log_format(s: &str) -> anyhow::Result<LogFormat> {
    LogFormat::from_config(s).context("parsing log format")
}
