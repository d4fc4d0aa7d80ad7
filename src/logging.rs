use time::macros::format_description;
use tracing_subscriber::{
    EnvFilter,
    fmt::{format::FmtSpan, time::UtcTime},
};

/// Filter used when `RUST_LOG` is unset.
fn default_directives(verbose: bool) -> &'static str {
    if verbose { "info,workhero=debug" } else { "info" }
}

/// Initialize the console subscriber for logging.
///
/// `RUST_LOG` wins over `verbose` when set. Logs go to stderr so progress
/// output on stdout stays readable.
pub fn init_console_subscriber(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)));
    let timer = UtcTime::new(format_description!(
        "[year]-[month]-[day]T[hour repr:24]:[minute]:[second].[subsecond digits:3]Z"
    ));
    // A second call (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_timer(timer)
        .with_target(true)
        .with_level(true)
        .with_ansi(console::colors_enabled_stderr())
        .with_writer(std::io::stderr)
        .try_init();
}
