pub mod logging {
    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing::subscriber::SetGlobalDefaultError;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl From<LogLevel> for LevelFilter {
        fn from(level: LogLevel) -> Self {
            match level {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error(transparent)]
        AlreadySet(#[from] SetGlobalDefaultError),
    }

    // Keeps the non-blocking writer flushing for the life of the process.
    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }
        let (filter, throttled_deps) = filter_directives(
            std::env::var("MA_LOG_FILTER").ok(),
            std::env::var("RUST_LOG").ok(),
            config.level.into(),
            env_truthy("MA_TRACE_DEPS"),
        );

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(filter))
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_ids(config.level >= LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
        let _ = GUARD.set(guard);

        if throttled_deps {
            tracing::info!(
                targets = ?NOISY_DEP_TARGETS,
                "dependency logs capped at warn; set MA_TRACE_DEPS=1 or MA_LOG_FILTER to override"
            );
        }
        Ok(())
    }

    fn env_truthy(var: &str) -> bool {
        std::env::var(var)
            .map(|v| v != "0" && !v.is_empty())
            .unwrap_or(false)
    }

    const NOISY_DEP_TARGETS: &[&str] = &[
        "webrtc",
        "webrtc_ice",
        "webrtc_dtls",
        "webrtc_sctp",
        "webrtc_mdns",
        "webrtc_srtp",
        "tungstenite",
        "tokio_tungstenite",
    ];

    /// Resolves the filter directive string. An explicit `MA_LOG_FILTER` wins,
    /// then `RUST_LOG`, then the CLI level with dependency targets capped at
    /// `warn`. The flag reports whether that cap was applied.
    pub(crate) fn filter_directives(
        ma_filter: Option<String>,
        rust_log: Option<String>,
        level: LevelFilter,
        trace_deps: bool,
    ) -> (String, bool) {
        if let Some(filter) = ma_filter.filter(|f| !f.trim().is_empty()) {
            return (filter, false);
        }
        if let Some(filter) = rust_log.filter(|f| !f.trim().is_empty()) {
            return (filter, false);
        }
        let base = match level {
            LevelFilter::TRACE => "info,ma_client=trace,ma_webrtc=trace,ma=trace",
            LevelFilter::DEBUG => "info,ma_client=debug,ma_webrtc=debug,ma=debug",
            LevelFilter::INFO => "info",
            LevelFilter::WARN => "warn",
            LevelFilter::ERROR => "error",
            LevelFilter::OFF => "off",
        };
        if level > LevelFilter::WARN && !trace_deps {
            let mut filter = base.to_owned();
            for target in NOISY_DEP_TARGETS {
                filter.push(',');
                filter.push_str(target);
                filter.push_str("=warn");
            }
            (filter, true)
        } else {
            (base.to_owned(), false)
        }
    }

}
