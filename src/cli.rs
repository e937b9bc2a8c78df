//! Command-line interface for sessiond.
//!
//! Uses lexopt for minimal binary size overhead.

use std::ffi::OsString;
use std::path::PathBuf;

/// Command-line arguments.
#[derive(Debug, Clone, Default)]
pub struct Args {
    /// Path to configuration file.
    pub config: Option<PathBuf>,
    /// Log level (error, warn, info, debug, trace).
    pub log_level: Option<String>,
    /// Seconds between reload passes.
    pub sweep_secs: Option<u64>,
    /// Upper bound for session idle time, in milliseconds.
    pub max_idle_ms: Option<u64>,
    /// Upper bound for session lifetime, in milliseconds.
    pub max_live_ms: Option<u64>,
    /// Show version and exit.
    pub version: bool,
    /// Show help and exit.
    pub help: bool,
}

/// Parse command-line arguments.
pub fn parse_args() -> Result<Args, ArgsError> {
    parse_args_from(std::env::args_os())
}

fn number(name: &'static str, value: String) -> Result<u64, ArgsError> {
    value
        .parse()
        .map_err(|_| ArgsError::InvalidValue(name, value))
}

/// Parse arguments from an iterator (for testing).
pub fn parse_args_from<I>(args: I) -> Result<Args, ArgsError>
where
    I: IntoIterator<Item = OsString>,
{
    use lexopt::prelude::*;

    let mut result = Args::default();
    let mut parser = lexopt::Parser::from_iter(args);

    while let Some(arg) = parser.next()? {
        match arg {
            Short('h') | Long("help") => {
                result.help = true;
            }
            Short('V') | Long("version") => {
                result.version = true;
            }
            Short('c') | Long("config") => {
                result.config = Some(parser.value()?.parse()?);
            }
            Short('l') | Long("log-level") => {
                result.log_level = Some(parser.value()?.parse()?);
            }
            Long("sweep-secs") => {
                let value: String = parser.value()?.parse()?;
                result.sweep_secs = Some(number("sweep-secs", value)?);
            }
            Long("max-idle-ms") => {
                let value: String = parser.value()?.parse()?;
                result.max_idle_ms = Some(number("max-idle-ms", value)?);
            }
            Long("max-live-ms") => {
                let value: String = parser.value()?.parse()?;
                result.max_live_ms = Some(number("max-live-ms", value)?);
            }
            Value(val) => {
                return Err(ArgsError::UnexpectedArgument(val.to_string_lossy().into()));
            }
            _ => return Err(arg.unexpected().into()),
        }
    }

    Ok(result)
}

/// Print help message.
pub fn print_help() {
    let version = env!("CARGO_PKG_VERSION");
    println!(
        r#"sessiond {version}
In-memory session registry with idle/lifetime expiry

USAGE:
    sessiond [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file (JSON)
    -l, --log-level <LVL>   Log level (error, warn, info, debug, trace)
        --sweep-secs <N>    Seconds between reload passes [default: 30]
        --max-idle-ms <N>   Upper bound for session idle time
        --max-live-ms <N>   Upper bound for session lifetime
    -h, --help              Print help
    -V, --version           Print version

ENVIRONMENT VARIABLES:
    SESSIOND_DEFAULT_IDLE_MS  Default idle time for new sessions
    SESSIOND_DEFAULT_LIVE_MS  Default lifetime for new sessions
    SESSIOND_MAX_IDLE_MS      Idle time upper bound (overrides config)
    SESSIOND_MAX_LIVE_MS      Lifetime upper bound (overrides config)
    SESSIOND_SWEEP_SECS       Seconds between reload passes
    SESSIOND_LOG_LEVEL        Log level (overrides config)
    RUST_LOG                  Alternative log level setting

EXAMPLES:
    # Start with defaults
    sessiond

    # Start with config file and a fast sweep
    sessiond -c /etc/sessiond/config.json --sweep-secs 5
"#
    );
}

/// Print version.
pub fn print_version() {
    println!("sessiond {}", env!("CARGO_PKG_VERSION"));
}

/// Argument parsing errors.
#[derive(Debug)]
pub enum ArgsError {
    /// Lexopt parsing error.
    Lexopt(lexopt::Error),
    /// Invalid argument value.
    InvalidValue(&'static str, String),
    /// Unexpected positional argument.
    UnexpectedArgument(String),
}

impl std::fmt::Display for ArgsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lexopt(e) => write!(f, "{}", e),
            Self::InvalidValue(name, value) => {
                write!(f, "invalid value for --{}: '{}'", name, value)
            }
            Self::UnexpectedArgument(arg) => {
                write!(f, "unexpected argument: '{}'", arg)
            }
        }
    }
}

impl std::error::Error for ArgsError {}

impl From<lexopt::Error> for ArgsError {
    fn from(e: lexopt::Error) -> Self {
        Self::Lexopt(e)
    }
}
