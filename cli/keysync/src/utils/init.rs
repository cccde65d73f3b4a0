use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static LOGGER: OnceCell<()> = OnceCell::new();

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise the verbosity count maps to a
/// filter over our own crates. Logs go to stderr so diff and summary
/// output stay clean on stdout.
pub fn init_logger(verbosity: usize) {
    LOGGER.get_or_init(|| {
        let directives = match verbosity {
            0 => "keysync=warn,keysync_sdk=warn",
            1 => "keysync=info,keysync_sdk=info",
            2 => "keysync=debug,keysync_sdk=debug,keysync_core=debug",
            _ => "trace",
        };
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(directives));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    });
}
