use tracing_subscriber::EnvFilter;
use crate::err::StratusErr;

/// the filter used when `RUST_LOG` is not set
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "stratus=info,warn",
        1 => "stratus=debug,info",
        _ => "trace",
    }
}

/// install the global fmt subscriber.  `RUST_LOG` wins over the verbosity flag
pub fn init(verbosity: u8) -> Result<(), StratusErr> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbosity > 1)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(StratusErr::msg)
}
