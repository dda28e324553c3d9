//! Common CLI flags for logging, and the subscriber they configure.
use std::{fmt::Display, str::FromStr};

use thiserror::Error;
use tracing::Subscriber;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid log filter {filter:?}: {source}")]
    InvalidFilter {
        filter: String,
        source: tracing_subscriber::filter::ParseError,
    },

    #[error("Cannot set global tracing subscriber: {0}")]
    SetGlobalDefault(#[from] tracing_subscriber::util::TryInitError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Full,
    Pretty,
    Json,
    Logfmt,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            "logfmt" => Ok(Self::Logfmt),
            _ => Err(format!(
                "Invalid log format '{s}'. Valid options: full, pretty, json, logfmt"
            )),
        }
    }
}

impl Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
            Self::Logfmt => write!(f, "logfmt"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDestination {
    Stdout,
    Stderr,
}

impl FromStr for LogDestination {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            _ => Err(format!(
                "Invalid log destination '{s}'. Valid options: stdout, stderr"
            )),
        }
    }
}

impl Display for LogDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// CLI config for the logging related subset of options.
#[derive(Debug, Clone, clap::Parser)]
pub struct LoggingConfig {
    /// Logs: filter directive
    ///
    /// Configures log severity level filter, by target.
    ///
    /// Simplest options: error, warn, info, debug, trace
    ///
    /// Levels for different modules can be specified. For example
    /// `debug,sqlx=warn` specifies debug logging for all modules except for
    /// the `sqlx` crate, which will only display warn level logging.
    ///
    /// Extended syntax provided by `tracing-subscriber` includes span/field
    /// filters. See <https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html> for more details.
    ///
    /// Overridden by `-v`.
    #[clap(long = "log-filter", env = "LOG_FILTER", action)]
    pub log_filter: Option<String>,

    /// Logs: filter short-hand
    ///
    /// Convenient way to set log severity level filter.
    /// Overrides `--log-filter`.
    ///
    /// -v   'info'
    ///
    /// -vv  'debug,sqlx=info'
    ///
    /// -vvv 'trace'
    #[clap(
        short = 'v',
        long = "verbose",
        action = clap::ArgAction::Count,
    )]
    pub log_verbose_count: u8,

    /// Logs: destination
    ///
    /// Can be one of: stdout, stderr
    #[clap(
        long = "log-destination",
        env = "LOG_DESTINATION",
        default_value = "stdout",
        action
    )]
    pub log_destination: LogDestination,

    /// Logs: message format
    ///
    /// Can be one of:
    ///
    /// full: human-readable, single line
    ///
    /// pretty: human-readable, multi line
    ///
    /// json: machine-parseable, one object per line
    ///
    /// logfmt: compact, single line
    #[clap(
        long = "log-format",
        env = "LOG_FORMAT",
        default_value = "full",
        action
    )]
    pub log_format: LogFormat,
}

impl LoggingConfig {
    pub fn to_builder(&self) -> Builder {
        self.with_builder(Builder::new())
    }

    /// Applies all config entries to `builder`.
    pub fn with_builder(&self, builder: Builder) -> Builder {
        builder
            .with_log_filter(&self.log_filter)
            // with_log_verbose_count goes after with_log_filter because our CLI flag state
            // that -v overrides --log-filter.
            .with_log_verbose_count(self.log_verbose_count)
            .with_log_destination(self.log_destination)
            .with_log_format(self.log_format)
    }

    pub fn install_global_subscriber(&self) -> Result<()> {
        self.to_builder().install_global()
    }
}

/// Builder for the logging subscriber.
pub struct Builder {
    log_format: LogFormat,
    log_filter: Option<String>,
    // used when log_filter is none.
    default_log_filter: String,
    make_writer: BoxMakeWriter,
    with_target: bool,
    with_ansi: bool,
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("log_format", &self.log_format)
            .field("log_filter", &self.log_filter)
            .field("default_log_filter", &self.default_log_filter)
            .field("with_target", &self.with_target)
            .field("with_ansi", &self.with_ansi)
            .finish_non_exhaustive()
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Full,
            log_filter: None,
            default_log_filter: Self::DEFAULT_LOG_FILTER.to_string(),
            make_writer: BoxMakeWriter::new(std::io::stdout),
            with_target: true,
            with_ansi: true,
        }
    }
}

impl Builder {
    pub const DEFAULT_LOG_FILTER: &'static str = "warn";

    pub fn new() -> Self {
        Self::default()
    }

    /// Set log_filter using a simple numeric "verbosity level".
    ///
    /// 0 means, keep existing `log_filter` value.
    pub fn with_log_verbose_count(self, log_verbose_count: u8) -> Self {
        let log_filter = match log_verbose_count {
            0 => self.log_filter,
            1 => Some(String::from("info")),
            2 => Some(String::from("debug,sqlx=info")),
            _ => Some(String::from("trace")),
        };
        Self { log_filter, ..self }
    }

    pub fn with_log_filter(self, log_filter: &Option<String>) -> Self {
        Self {
            log_filter: log_filter.clone(),
            ..self
        }
    }

    pub fn with_default_log_filter(self, default_log_filter: impl Into<String>) -> Self {
        Self {
            default_log_filter: default_log_filter.into(),
            ..self
        }
    }

    pub fn with_log_format(self, log_format: LogFormat) -> Self {
        Self { log_format, ..self }
    }

    pub fn with_log_destination(self, log_destination: LogDestination) -> Self {
        let make_writer = match log_destination {
            LogDestination::Stdout => BoxMakeWriter::new(std::io::stdout),
            LogDestination::Stderr => BoxMakeWriter::new(std::io::stderr),
        };
        self.with_writer(make_writer)
    }

    pub fn with_writer(self, make_writer: BoxMakeWriter) -> Self {
        Self {
            make_writer,
            ..self
        }
    }

    /// Sets whether or not an event's target and location are displayed.
    ///
    /// Defaults to true.
    pub fn with_target(self, with_target: bool) -> Self {
        Self {
            with_target,
            ..self
        }
    }

    /// Enable/disable ANSI encoding for formatted events (i.e. colors).
    ///
    /// Defaults to true. Never applied to the json format.
    pub fn with_ansi(self, with_ansi: bool) -> Self {
        Self { with_ansi, ..self }
    }

    pub fn build(self) -> Result<impl Subscriber + Send + Sync + use<>> {
        let filter = self
            .log_filter
            .unwrap_or(self.default_log_filter);
        let env_filter = EnvFilter::try_new(&filter)
            .map_err(|source| Error::InvalidFilter { filter, source })?;

        let writer = self.make_writer;
        let with_target = self.with_target;
        let with_ansi = self.with_ansi;
        let log_layer: Box<dyn Layer<Registry> + Send + Sync> = match self.log_format {
            LogFormat::Full => fmt::layer()
                .with_writer(writer)
                .with_target(with_target)
                .with_ansi(with_ansi)
                .boxed(),
            LogFormat::Pretty => fmt::layer()
                .pretty()
                .with_writer(writer)
                .with_target(with_target)
                .with_ansi(with_ansi)
                .boxed(),
            LogFormat::Json => fmt::layer()
                .json()
                .with_writer(writer)
                .with_target(with_target)
                .with_ansi(false)
                .boxed(),
            LogFormat::Logfmt => fmt::layer()
                .compact()
                .with_writer(writer)
                .with_target(with_target)
                .with_ansi(with_ansi)
                .boxed(),
        };

        Ok(tracing_subscriber::registry()
            .with(log_layer)
            .with(env_filter))
    }

    /// Build and install the subscriber as the process-wide default.
    pub fn install_global(self) -> Result<()> {
        self.build()?.try_init()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use clap::Parser;
    use std::{
        io::Write,
        sync::{Arc, Mutex},
    };
    use tracing::{debug, info};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Capture {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn capture(builder: Builder, f: impl FnOnce()) -> String {
        let buf = Capture::default();
        let writer = buf.clone();
        let subscriber = builder
            .with_writer(BoxMakeWriter::new(move || writer.clone()))
            .with_ansi(false)
            .build()
            .unwrap();
        tracing::subscriber::with_default(subscriber, f);
        buf.contents()
    }

    #[test]
    fn test_parse_formats() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("logfmt".parse::<LogFormat>().unwrap(), LogFormat::Logfmt);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(
            "stderr".parse::<LogDestination>().unwrap(),
            LogDestination::Stderr
        );
        assert_eq!(LogFormat::Pretty.to_string(), "pretty");
    }

    #[test]
    fn test_config_defaults() {
        let config = LoggingConfig::try_parse_from(["cli"]).unwrap();
        assert_eq!(config.log_filter, None);
        assert_eq!(config.log_verbose_count, 0);
        assert_eq!(config.log_destination, LogDestination::Stdout);
        assert_eq!(config.log_format, LogFormat::Full);

        let config = LoggingConfig::try_parse_from(["cli", "-vv", "--log-format", "json"]).unwrap();
        assert_eq!(config.log_verbose_count, 2);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_default_filter_is_warn() {
        let out = capture(Builder::new(), || {
            info!("hidden");
            tracing::warn!("shown");
        });
        assert!(!out.contains("hidden"));
        assert!(out.contains("shown"));
    }

    #[test]
    fn test_verbose_overrides_filter() {
        let builder = Builder::new()
            .with_log_filter(&Some(String::from("error")))
            .with_log_verbose_count(2);
        let out = capture(builder, || debug!("now visible"));
        assert!(out.contains("now visible"));
    }

    #[test]
    fn test_json_format() {
        let builder = Builder::new()
            .with_log_filter(&Some(String::from("info")))
            .with_log_format(LogFormat::Json);
        let out = capture(builder, || info!(table = "ratings", "loaded"));
        assert!(out.contains(r#""table":"ratings""#), "{out}");
        assert!(out.contains(r#""message":"loaded""#), "{out}");
    }

    #[test]
    fn test_invalid_filter() {
        let builder = Builder::new().with_log_filter(&Some(String::from("ratings=loud")));
        assert_matches!(builder.build().err(), Some(Error::InvalidFilter { .. }));
    }
}
