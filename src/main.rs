//! usn-watcher CLI
//!
//! Streams NTFS change-journal events for one volume to stdout (and
//! optionally a local named pipe) until interrupted.

#[cfg(windows)]
mod cli {
    use clap::{Parser, ValueEnum};
    use console::style;
    use std::time::Duration;
    use usn_watcher::{FilterExpr, OutputFormat, Watcher, WatcherConfig, WatcherError};

    /// usn-watcher - stream NTFS change-journal events as NDJSON
    #[derive(Parser)]
    #[command(name = "usn-watcher")]
    #[command(version)]
    #[command(about = "Stream NTFS change-journal events for a volume", long_about = None)]
    struct Cli {
        /// Drive letter of the NTFS volume to watch (e.g. C)
        volume: char,

        /// Output format for stdout
        #[arg(long, value_enum, default_value_t = FormatArg::Table)]
        format: FormatArg,

        /// Poll interval in milliseconds
        #[arg(long = "poll-ms", default_value_t = 250)]
        poll_ms: u64,

        /// Coalescer quiet window in milliseconds (floor 10)
        #[arg(long = "debounce-ms", default_value_t = 50)]
        debounce_ms: u64,

        /// Event filter expression, e.g. "reason=FILECREATE ext=log !dir=true"
        #[arg(long)]
        filter: Option<String>,

        /// Skip the background MFT scan; paths resolve only as events arrive
        #[arg(long = "no-populate")]
        no_populate: bool,

        /// Debug-level logging on stderr
        #[arg(long)]
        verbose: bool,

        /// Serve events on \\.\pipe\usn-watcher-<LETTER>
        #[arg(long)]
        pipe: bool,

        /// Log events dropped by the filter at debug level
        #[arg(long = "filter-log")]
        filter_log: bool,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
    enum FormatArg {
        Table,
        Json,
    }

    impl From<FormatArg> for OutputFormat {
        fn from(arg: FormatArg) -> Self {
            match arg {
                FormatArg::Table => OutputFormat::Table,
                FormatArg::Json => OutputFormat::Json,
            }
        }
    }

    fn init_tracing(verbose: bool) {
        use tracing_subscriber::EnvFilter;

        let default_directives = if verbose {
            "usn_watcher=debug,info"
        } else {
            "usn_watcher=info,warn"
        };
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directives));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    pub fn run() {
        let cli = Cli::parse();
        init_tracing(cli.verbose);

        let filter = match cli.filter.as_deref().map(FilterExpr::parse) {
            None => None,
            Some(Ok(filter)) => Some(filter),
            Some(Err(e)) => {
                eprintln!("{} {}", style("error:").red().bold(), e);
                std::process::exit(1);
            }
        };

        let mut config = WatcherConfig::new(cli.volume);
        config.poll_interval = Duration::from_millis(cli.poll_ms);
        config.debounce = Duration::from_millis(cli.debounce_ms);
        config.format = cli.format.into();
        config.populate = !cli.no_populate;
        config.pipe = cli.pipe;
        config.filter = filter;
        config.log_filtered = cli.filter_log;

        let watcher = Watcher::new(config);
        let cancel = watcher.cancel_flag();
        if let Err(e) = ctrlc::set_handler(move || {
            cancel.store(true, std::sync::atomic::Ordering::Relaxed);
        }) {
            eprintln!("{} failed to install Ctrl-C handler: {}", style("error:").red().bold(), e);
            std::process::exit(1);
        }

        match watcher.run() {
            Ok(()) => {}
            Err(WatcherError::PermissionDenied(letter)) => {
                eprintln!(
                    "{} access to volume {}: was denied. Reading the USN journal requires an elevated (administrator) prompt.",
                    style("error:").red().bold(),
                    letter
                );
                std::process::exit(1);
            }
            Err(e) => {
                eprintln!("{} {}", style("error:").red().bold(), e);
                std::process::exit(1);
            }
        }
    }
}

#[cfg(windows)]
fn main() {
    cli::run();
}

#[cfg(not(windows))]
fn main() {
    eprintln!("usn-watcher reads the NTFS USN change journal and only runs on Windows");
    std::process::exit(1);
}
