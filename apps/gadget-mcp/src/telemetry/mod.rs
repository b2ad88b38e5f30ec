pub mod logging {
    //! Process-wide `tracing` setup.
    //!
    //! Stdout belongs to the stdio MCP transport, so events are written to
    //! stderr or to an append-only file through a non-blocking worker.

    use std::fs::{self, File, OpenOptions};
    use std::path::{Path, PathBuf};
    use std::sync::OnceLock;

    use clap::ValueEnum;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
    use tracing_subscriber::EnvFilter;

    /// Full filter directives, replacing the level-derived default.
    pub const FILTER_ENV: &str = "GADGET_MCP_LOG_FILTER";
    /// Lets dependency crates log at trace level too.
    pub const TRACE_DEPS_ENV: &str = "GADGET_MCP_TRACE_DEPS";

    const WORKSPACE_TARGETS: &[&str] = &["gadget_mcp", "gadget_runtime"];
    const CHATTY_TARGETS: &[&str] = &["tokio", "runtime", "mio", "config"];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn as_str(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
                LogLevel::Trace => "trace",
            }
        }

        /// Debug and trace raise only the workspace crates; everything else
        /// stays at info.
        fn scoped_to_workspace(self) -> bool {
            self >= LogLevel::Debug
        }
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
        #[error("logging already initialized")]
        AlreadyInitialized,
        #[error("cannot open log file {path:?}: {source}")]
        LogFile {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("invalid log filter {directives:?}: {reason}")]
        Filter { directives: String, reason: String },
        #[error("failed to install subscriber: {0}")]
        Install(String),
    }

    static WORKER: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Fails on a second call.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if WORKER.get().is_some() {
            return Err(InitError::AlreadyInitialized);
        }

        let directives = match std::env::var(FILTER_ENV) {
            Ok(custom) => custom,
            Err(_) => directives_for(config.level, trace_deps_enabled()),
        };
        let filter = EnvFilter::try_new(&directives).map_err(|err| InitError::Filter {
            reason: err.to_string(),
            directives: directives.clone(),
        })?;

        let (writer, guard) = sink(config.file.as_deref())?;
        let verbose = config.level.scoped_to_workspace();
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(verbose)
            .with_thread_names(config.level == LogLevel::Trace)
            .with_ansi(false)
            .with_writer(writer)
            .try_init()
            .map_err(|err| InitError::Install(err.to_string()))?;

        // keep the worker alive for the life of the process
        WORKER.set(guard).map_err(|_| InitError::AlreadyInitialized)?;
        tracing::debug!(%directives, "logging initialized");
        Ok(())
    }

    fn sink(file: Option<&Path>) -> Result<(NonBlocking, WorkerGuard), InitError> {
        match file {
            Some(path) => Ok(tracing_appender::non_blocking(open_log_file(path)?)),
            None => Ok(tracing_appender::non_blocking(std::io::stderr())),
        }
    }

    fn open_log_file(path: &Path) -> Result<File, InitError> {
        let fail = |source| InitError::LogFile {
            path: path.to_path_buf(),
            source,
        };
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(fail)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(fail)
    }

    fn trace_deps_enabled() -> bool {
        std::env::var(TRACE_DEPS_ENV).is_ok_and(|value| !value.is_empty() && value != "0")
    }

    /// Default `EnvFilter` directives for `level`.
    fn directives_for(level: LogLevel, trace_deps: bool) -> String {
        if !level.scoped_to_workspace() {
            return level.as_str().to_string();
        }
        let mut directives = vec!["info".to_string()];
        directives.extend(
            WORKSPACE_TARGETS
                .iter()
                .map(|target| format!("{target}={}", level.as_str())),
        );
        if level == LogLevel::Trace && !trace_deps {
            directives.extend(CHATTY_TARGETS.iter().map(|target| format!("{target}=info")));
        }
        directives.join(",")
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn quiet_levels_apply_globally() {
            assert_eq!(directives_for(LogLevel::Warn, false), "warn");
            assert_eq!(directives_for(LogLevel::Info, true), "info");
        }

        #[test]
        fn debug_raises_workspace_crates_only() {
            assert_eq!(
                directives_for(LogLevel::Debug, false),
                "info,gadget_mcp=debug,gadget_runtime=debug"
            );
        }

        #[test]
        fn trace_caps_dependencies_unless_enabled() {
            let capped = directives_for(LogLevel::Trace, false);
            assert!(capped.starts_with("info,gadget_mcp=trace,gadget_runtime=trace,"));
            assert!(capped.ends_with("mio=info,config=info"));
            assert_eq!(
                directives_for(LogLevel::Trace, true),
                "info,gadget_mcp=trace,gadget_runtime=trace"
            );
        }

        #[test]
        fn default_directives_parse() {
            for level in LogLevel::value_variants() {
                assert!(EnvFilter::try_new(directives_for(*level, false)).is_ok());
            }
        }

        #[test]
        fn level_conversion() {
            assert_eq!(LevelFilter::from(LogLevel::Error), LevelFilter::ERROR);
            assert_eq!(LevelFilter::from(LogLevel::Trace), LevelFilter::TRACE);
            assert_eq!(LogLevel::default(), LogLevel::Warn);
        }

        #[test]
        fn log_file_parent_is_created() {
            let dir = std::env::temp_dir().join(format!("gadget-mcp-log-{}", uuid::Uuid::new_v4()));
            let path = dir.join("nested").join("server.log");
            open_log_file(&path).unwrap();
            assert!(path.exists());
            let _ = fs::remove_dir_all(dir);
        }
    }
}
