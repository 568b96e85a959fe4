use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise 0 = warn, 1 = info, 2+ = debug.
/// With `log_dir`, events also go to a daily-rotated file, and the returned
/// guard must be held until exit so buffered lines get flushed.
pub fn init(verbose: u8, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
    0 => EnvFilter::new("offline_proxy=warn"),
    1 => EnvFilter::new("offline_proxy=info"),
    _ => EnvFilter::new("offline_proxy=debug"),
  });

  let stderr = fmt::layer().with_target(false).with_writer(std::io::stderr);

  let (file, guard) = match log_dir {
    Some(dir) => {
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      let appender = tracing_appender::rolling::daily(dir, "offline-proxy.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (
        Some(fmt::layer().with_ansi(false).with_writer(writer)),
        Some(guard),
      )
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(stderr)
    .with(file)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
