//! Log filter selection and the persistent file sink.
//!
//! The subscriber itself is assembled by the binary; this module only decides
//! which filters apply to which sink and whether a rolling file appender can
//! be opened under the data directory.

use std::fs;
use std::path::PathBuf;

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DETECTOR_STDOUT_TARGET: &str = "detector_stdout";
pub const DETECTOR_STDERR_TARGET: &str = "detector_stderr";
pub const DEFAULT_NOISE_FILTER: &str = "detector_stdout=warn,detector_stderr=warn";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "snapscan";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

const WORKER_OUTPUT_TARGETS: [&str; 2] = [DETECTOR_STDOUT_TARGET, DETECTOR_STDERR_TARGET];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeLogMode {
    Cli,
    Server,
}

impl RuntimeLogMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Server => "server",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub mode: RuntimeLogMode,
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            mode: RuntimeLogMode::Server,
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilterPlan {
    pub user_filter: String,
    pub console_filter: String,
    pub file_filter: String,
}

#[derive(Debug)]
pub struct LoggingInitPlan {
    pub filters: LoggingFilterPlan,
    pub file_sink: FileSinkPlan,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready {
        log_dir: PathBuf,
        appender: RollingFileAppender,
    },
    Fallback {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

pub fn compose_logging_init_plan(options: &LoggingInitOptions) -> LoggingInitPlan {
    LoggingInitPlan {
        filters: compose_logging_filters(options),
        file_sink: build_file_sink_plan(options),
    }
}

pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::Fallback {
            attempted_log_dir: None,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        };
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let retention_files = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };

    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(log_file_prefix(options.mode))
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files)
        .build(&log_dir);

    match built {
        Ok(appender) => FileSinkPlan::Ready { log_dir, appender },
        Err(error) => FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to initialize rolling file sink: {error}"),
        },
    }
}

/// Worker output is noisy, so an implicit filter keeps it off the console
/// while the file sink still records it at debug level.
/// CLI runs and the server write to separate files in the same log dir.
pub fn log_file_prefix(mode: RuntimeLogMode) -> String {
    format!("{DEFAULT_LOG_FILE_PREFIX}-{}", mode.as_str())
}

pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilterPlan {
    let user_filter = select_user_filter(options);
    let implicit = options.cli_log_filter.is_none() && options.verbose == 0;

    let (console_filter, file_filter) = if implicit && !options.noise_filter.trim().is_empty() {
        let file_noise = rewrite_noise_filter_for_file(&options.noise_filter);
        (
            format!("{},{user_filter}", options.noise_filter),
            format!("{file_noise},{user_filter}"),
        )
    } else {
        (user_filter.clone(), user_filter.clone())
    };

    LoggingFilterPlan {
        user_filter,
        console_filter,
        file_filter,
    }
}

fn select_user_filter(options: &LoggingInitOptions) -> String {
    if let Some(filter) = options.cli_log_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        filter.to_string()
    } else {
        options.default_log_filter.clone()
    }
}

fn rewrite_noise_filter_for_file(noise_filter: &str) -> String {
    let mut directives = Vec::new();
    let mut seen: Vec<&str> = Vec::new();

    for directive in noise_filter
        .split(',')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
    {
        let target = directive
            .split_once('=')
            .map(|(target, _)| target.trim())
            .unwrap_or(directive);
        if WORKER_OUTPUT_TARGETS.contains(&target) {
            if !seen.contains(&target) {
                directives.push(format!("{target}=debug"));
                seen.push(target);
            }
            continue;
        }
        directives.push(directive.to_string());
    }

    for target in WORKER_OUTPUT_TARGETS {
        if !seen.contains(&target) {
            directives.push(format!("{target}=debug"));
        }
    }

    directives.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn cli_log_filter_overrides_everything() {
        let options = LoggingInitOptions {
            verbose: 2,
            cli_log_filter: Some("snapscan_core=trace".to_string()),
            rust_log_env: Some("error".to_string()),
            ..Default::default()
        };

        let filters = compose_logging_filters(&options);
        assert_eq!(filters.user_filter, "snapscan_core=trace");
        assert_eq!(filters.console_filter, "snapscan_core=trace");
        assert_eq!(filters.file_filter, "snapscan_core=trace");
    }

    #[test]
    fn verbose_levels_map_to_debug_and_trace() {
        let debug = LoggingInitOptions {
            verbose: 1,
            rust_log_env: Some("warn".to_string()),
            ..Default::default()
        };
        let trace = LoggingInitOptions {
            verbose: 2,
            ..Default::default()
        };

        assert_eq!(compose_logging_filters(&debug).console_filter, "debug");
        assert_eq!(compose_logging_filters(&trace).console_filter, "trace");
    }

    #[test]
    fn implicit_filter_silences_worker_output_on_console_only() {
        let options = LoggingInitOptions {
            rust_log_env: Some("info".to_string()),
            ..Default::default()
        };

        let filters = compose_logging_filters(&options);
        assert_eq!(
            filters.console_filter,
            format!("{DEFAULT_NOISE_FILTER},info")
        );
        assert_eq!(
            filters.file_filter,
            "detector_stdout=debug,detector_stderr=debug,info"
        );
    }

    #[test]
    fn file_filter_adds_missing_worker_targets() {
        let options = LoggingInitOptions {
            noise_filter: "hyper=warn".to_string(),
            ..Default::default()
        };

        let filters = compose_logging_filters(&options);
        assert_eq!(filters.console_filter, "hyper=warn,info");
        assert_eq!(
            filters.file_filter,
            "hyper=warn,detector_stdout=debug,detector_stderr=debug,info"
        );
    }

    #[test]
    fn file_sink_uses_log_dir_under_data_dir() {
        let data_dir = tempdir().expect("tempdir");
        let options = LoggingInitOptions {
            data_dir: Some(data_dir.path().to_path_buf()),
            ..Default::default()
        };

        match build_file_sink_plan(&options) {
            FileSinkPlan::Ready { log_dir, .. } => {
                assert_eq!(log_dir, data_dir.path().join(DEFAULT_LOG_DIR_NAME));
                assert!(log_dir.exists());
            }
            FileSinkPlan::Fallback { reason, .. } => {
                panic!("expected ready file sink, got fallback: {reason}")
            }
        }
    }

    #[test]
    fn file_sink_names_files_after_the_runtime_mode() {
        use std::io::Write;

        let data_dir = tempdir().expect("tempdir");
        let options = LoggingInitOptions {
            mode: RuntimeLogMode::Cli,
            data_dir: Some(data_dir.path().to_path_buf()),
            ..Default::default()
        };

        let FileSinkPlan::Ready {
            log_dir,
            mut appender,
        } = build_file_sink_plan(&options)
        else {
            panic!("expected ready file sink");
        };
        appender.write_all(b"hello\n").expect("write log line");
        appender.flush().expect("flush log");

        let names: Vec<String> = std::fs::read_dir(&log_dir)
            .expect("read log dir")
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(
            names.iter().any(|name| name.starts_with("snapscan-cli.")),
            "unexpected log files: {names:?}"
        );
        assert_eq!(log_file_prefix(RuntimeLogMode::Server), "snapscan-server");
    }

    #[test]
    fn file_sink_falls_back_without_data_dir() {
        let plan = build_file_sink_plan(&LoggingInitOptions::default());
        assert!(!plan.is_ready());
    }

    #[test]
    fn file_sink_falls_back_when_log_dir_cannot_be_created() {
        let not_a_dir = NamedTempFile::new().expect("named temp file");
        let options = LoggingInitOptions {
            data_dir: Some(not_a_dir.path().to_path_buf()),
            ..Default::default()
        };

        match build_file_sink_plan(&options) {
            FileSinkPlan::Ready { .. } => panic!("expected fallback file sink"),
            FileSinkPlan::Fallback {
                attempted_log_dir,
                reason,
            } => {
                assert_eq!(
                    attempted_log_dir,
                    Some(not_a_dir.path().join(DEFAULT_LOG_DIR_NAME))
                );
                assert!(reason.contains("failed to create log directory"));
            }
        }
    }
}
