//! Tracing subscriber setup for console output and rolling JSON log files.
//!
//! Each output has its own [`EnvFilter`], read from its own environment
//! variable, so operators can keep the console quiet while the log files
//! capture signing details at `debug`.
use std::path::PathBuf;

use bon::Builder;
use snafu::{ResultExt as _, Snafu};
use tracing::{level_filters::LevelFilter, subscriber::SetGlobalDefaultError};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{InitError, RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to initialize rolling file appender"))]
    InitRollingFileAppender { source: InitError },

    #[snafu(display("unable to set the global default subscriber"))]
    SetGlobalDefaultSubscriber { source: SetGlobalDefaultError },
}

/// Human readable output on stdout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsoleOutput {
    /// The environment variable holding the filter directives.
    pub filter_variable: &'static str,
    pub default_level: LevelFilter,
    pub format: ConsoleLogFormat,
}

/// JSON lines written to rolling files by a background worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileOutput {
    /// The environment variable holding the filter directives.
    pub filter_variable: &'static str,
    pub default_level: LevelFilter,
    pub directory: PathBuf,
    pub rotation_period: RotationPeriod,
    pub max_files: Option<usize>,
}

/// The tracing outputs of one process.
///
/// [`Tracing::init`] installs the global subscriber and hands the instance
/// back. It holds the worker guard of the file output, which flushes pending
/// events on drop. Keep it bound to a named variable for the lifetime of the
/// process, `let _ =` drops it immediately.
///
/// ```
/// use multiroot_telemetry::tracing::{Error, TelemetryOptions, Tracing};
///
/// fn main() -> Result<(), Error> {
///     let _tracing_guard = Tracing::pre_configured("multirootca", TelemetryOptions::default())
///         .init()?;
///
///     tracing::info!("ready");
///     Ok(())
/// }
/// ```
#[derive(Builder)]
pub struct Tracing {
    /// Prefix of the log file names.
    service_name: &'static str,

    console_output: Option<ConsoleOutput>,
    file_output: Option<FileOutput>,

    #[builder(skip)]
    worker_guard: Option<WorkerGuard>,
}

impl Tracing {
    /// Filter directives of the console output.
    pub const CONSOLE_LOG_LEVEL: &str = "CONSOLE_LOG_LEVEL";
    /// Filter directives of the file output.
    pub const FILE_LOG_LEVEL: &str = "FILE_LOG_LEVEL";
    /// Suffix of the log file names.
    pub const FILE_LOG_SUFFIX: &str = "tracing-rs.json";

    /// Console output unless disabled, file output if a directory is given.
    /// Both default to `INFO`.
    pub fn pre_configured(service_name: &'static str, options: TelemetryOptions) -> Self {
        let console_output = (!options.console_log_disabled).then(|| ConsoleOutput {
            filter_variable: Self::CONSOLE_LOG_LEVEL,
            default_level: LevelFilter::INFO,
            format: options.console_log_format.unwrap_or_default(),
        });
        let file_output = options.file_log_directory.map(|directory| FileOutput {
            filter_variable: Self::FILE_LOG_LEVEL,
            default_level: LevelFilter::INFO,
            directory,
            rotation_period: options.file_log_rotation_period.unwrap_or_default(),
            max_files: options.file_log_max_files,
        });

        Self::builder()
            .service_name(service_name)
            .maybe_console_output(console_output)
            .maybe_file_output(file_output)
            .build()
    }

    /// Installs the configured outputs as the global default subscriber.
    pub fn init(mut self) -> Result<Self> {
        let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

        if let Some(console) = &self.console_output {
            let filter = env_filter(console.filter_variable, console.default_level);
            let layer = match console.format {
                ConsoleLogFormat::Plain => tracing_subscriber::fmt::layer()
                    .with_filter(filter)
                    .boxed(),
                ConsoleLogFormat::Json => tracing_subscriber::fmt::layer()
                    .json()
                    .with_filter(filter)
                    .boxed(),
            };
            layers.push(layer);
        }

        if let Some(file) = &self.file_output {
            let mut appender = RollingFileAppender::builder()
                .rotation(file.rotation_period.clone().into())
                .filename_prefix(self.service_name)
                .filename_suffix(Self::FILE_LOG_SUFFIX);
            if let Some(max_files) = file.max_files {
                appender = appender.max_log_files(max_files);
            }
            let appender = appender
                .build(&file.directory)
                .context(InitRollingFileAppenderSnafu)?;

            let (writer, worker_guard) = tracing_appender::non_blocking(appender);
            self.worker_guard = Some(worker_guard);

            layers.push(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_filter(env_filter(file.filter_variable, file.default_level))
                    .boxed(),
            );
        }

        if !layers.is_empty() {
            tracing::subscriber::set_global_default(tracing_subscriber::registry().with(layers))
                .context(SetGlobalDefaultSubscriberSnafu)?;
        }

        Ok(self)
    }

    pub fn service_name(&self) -> &'static str {
        self.service_name
    }

    pub fn console_output(&self) -> Option<&ConsoleOutput> {
        self.console_output.as_ref()
    }

    pub fn file_output(&self) -> Option<&FileOutput> {
        self.file_output.as_ref()
    }
}

impl Drop for Tracing {
    fn drop(&mut self) {
        tracing::debug!(
            file_log.enabled = self.file_output.is_some(),
            "shutting down tracing subscribers"
        );
    }
}

fn env_filter(variable: &str, default_level: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_env_var(variable)
        .with_default_directive(default_level.into())
        .from_env_lossy()
}

/// Telemetry command line arguments, see [`Tracing::pre_configured`].
///
/// Derives [`clap::Args`] with the `clap` feature, every argument can also be
/// set through the environment variable of the same name.
#[cfg_attr(feature = "clap", derive(clap::Args))]
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TelemetryOptions {
    /// Disable console logs.
    #[cfg_attr(feature = "clap", arg(long, env))]
    pub console_log_disabled: bool,

    /// Output FORMAT of console logs.
    #[cfg_attr(feature = "clap", arg(long, env, value_name = "FORMAT"))]
    pub console_log_format: Option<ConsoleLogFormat>,

    /// Write JSON logs to files in DIRECTORY.
    #[cfg_attr(
        feature = "clap",
        arg(long, env, value_name = "DIRECTORY", group = "file_log")
    )]
    pub file_log_directory: Option<PathBuf>,

    /// Time PERIOD after which log files are rolled over.
    #[cfg_attr(
        feature = "clap",
        arg(long, env, value_name = "PERIOD", requires = "file_log")
    )]
    pub file_log_rotation_period: Option<RotationPeriod>,

    /// Maximum number of log files to keep.
    #[cfg_attr(feature = "clap", arg(long, env, requires = "file_log"))]
    pub file_log_max_files: Option<usize>,
}

#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[derive(Clone, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "PascalCase")]
pub enum RotationPeriod {
    Minutely,
    Hourly,
    Daily,

    #[default]
    Never,
}

impl From<RotationPeriod> for Rotation {
    fn from(value: RotationPeriod) -> Self {
        match value {
            RotationPeriod::Minutely => Self::MINUTELY,
            RotationPeriod::Hourly => Self::HOURLY,
            RotationPeriod::Daily => Self::DAILY,
            RotationPeriod::Never => Self::NEVER,
        }
    }
}

#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ConsoleLogFormat {
    #[default]
    Plain,
    Json,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn builder_without_outputs() {
        let tracing = Tracing::builder().service_name("test").build();

        assert_eq!(tracing.service_name(), "test");
        assert!(tracing.console_output().is_none());
        assert!(tracing.file_output().is_none());
    }

    #[test]
    fn pre_configured_defaults_to_plain_console() {
        let tracing = Tracing::pre_configured("test", TelemetryOptions::default());

        assert_eq!(
            tracing.console_output(),
            Some(&ConsoleOutput {
                filter_variable: Tracing::CONSOLE_LOG_LEVEL,
                default_level: LevelFilter::INFO,
                format: ConsoleLogFormat::Plain,
            })
        );
        assert!(tracing.file_output().is_none());
    }

    #[test]
    fn pre_configured_file_output() {
        let tracing = Tracing::pre_configured("test", TelemetryOptions {
            console_log_disabled: true,
            console_log_format: Some(ConsoleLogFormat::Json),
            file_log_directory: Some(PathBuf::from("/var/log/multirootca")),
            file_log_rotation_period: Some(RotationPeriod::Daily),
            file_log_max_files: Some(7),
        });

        assert!(tracing.console_output().is_none());
        assert_eq!(
            tracing.file_output(),
            Some(&FileOutput {
                filter_variable: Tracing::FILE_LOG_LEVEL,
                default_level: LevelFilter::INFO,
                directory: PathBuf::from("/var/log/multirootca"),
                rotation_period: RotationPeriod::Daily,
                max_files: Some(7),
            })
        );
    }

    #[rstest]
    #[case("Minutely", RotationPeriod::Minutely)]
    #[case("Daily", RotationPeriod::Daily)]
    #[case("Never", RotationPeriod::Never)]
    fn parse_rotation_period(#[case] input: &str, #[case] expected: RotationPeriod) {
        assert_eq!(input.parse::<RotationPeriod>().unwrap(), expected);
    }

    #[rstest]
    #[case("plain", ConsoleLogFormat::Plain)]
    #[case("json", ConsoleLogFormat::Json)]
    fn parse_console_log_format(#[case] input: &str, #[case] expected: ConsoleLogFormat) {
        assert_eq!(input.parse::<ConsoleLogFormat>().unwrap(), expected);
    }

    #[test]
    fn init_writes_file_logs() {
        let log_dir = tempfile::tempdir().unwrap();

        let tracing = Tracing::builder()
            .service_name("init-test")
            .file_output(FileOutput {
                filter_variable: "INIT_TEST_FILE_LOG",
                default_level: LevelFilter::INFO,
                directory: log_dir.path().to_owned(),
                rotation_period: RotationPeriod::Never,
                max_files: None,
            })
            .build()
            .init()
            .unwrap();

        tracing::info!(label = "primary", "file log smoke test");
        drop(tracing);

        let log_files: Vec<_> = std::fs::read_dir(log_dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(log_files.len(), 1);
        assert!(log_files[0].starts_with("init-test"));
        assert!(log_files[0].ends_with(Tracing::FILE_LOG_SUFFIX));
    }
}
