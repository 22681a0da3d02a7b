//! Error types for proxy benchmarking.
//!
//! Transfer errors never abort a run: they are folded into the per-chunk
//! results. Only configuration errors surface to the binary as an exit code.

use std::error::Error;
use std::fmt;
use std::io;

/// Exit codes for the application.
pub mod exit_codes {
    /// Successful execution.
    pub const SUCCESS: i32 = 0;
    /// Configuration error (invalid arguments, bad liveness URL).
    pub const CONFIG_ERROR: i32 = 3;
    /// The run was interrupted before every proxy finished.
    pub const INTERRUPTED: i32 = 130;
    /// Unknown/unexpected error.
    pub const UNKNOWN_ERROR: i32 = 99;
}

/// Categories of errors that can occur while driving traffic through a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The tunnel provider could not open a connection.
    Tunnel,
    /// TLS handshake over the tunnel failed.
    Tls,
    /// The worker deadline elapsed.
    Timeout,
    /// The server answered with a failing HTTP status.
    Status,
    /// The response could not be parsed as HTTP.
    Protocol,
    /// The response body could not be decoded.
    Decode,
    /// Invalid configuration.
    Config,
}

impl ErrorKind {
    /// Get the exit code for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::Config => exit_codes::CONFIG_ERROR,
            _ => exit_codes::UNKNOWN_ERROR,
        }
    }

    /// Get a user-friendly description of this error kind.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorKind::Tunnel => "Tunnel error",
            ErrorKind::Tls => "TLS/SSL error",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Status => "HTTP status error",
            ErrorKind::Protocol => "Protocol error",
            ErrorKind::Decode => "Decode error",
            ErrorKind::Config => "Configuration error",
        }
    }
}

/// Error raised by a single transfer, probe or geolocation attempt.
#[derive(Debug)]
pub struct BenchError {
    /// The kind of error.
    pub kind: ErrorKind,
    /// User-friendly error message.
    pub message: String,
    /// The underlying error, if any.
    pub source: Option<Box<dyn Error + Send + Sync>>,
}

impl BenchError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), source: None }
    }

    /// Attach the underlying error source.
    pub fn with_source(
        mut self,
        source: impl Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }

    pub fn tunnel(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Tunnel, message)
    }

    pub fn tls(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Tls, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn status(code: http::StatusCode) -> Self {
        Self::new(ErrorKind::Status, format!("server answered {}", code))
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Decode, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    /// Whether the error means the attempt ran out of time.
    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }
}

impl fmt::Display for BenchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.description(), self.message)
    }
}

impl Error for BenchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn Error + 'static))
    }
}

impl From<io::Error> for BenchError {
    fn from(error: io::Error) -> Self {
        let kind = classify_error(&error);
        BenchError::new(kind, error.to_string()).with_source(error)
    }
}

/// Classify an io error raised somewhere on the tunnel path.
pub fn classify_error(error: &io::Error) -> ErrorKind {
    match error.kind() {
        io::ErrorKind::TimedOut => return ErrorKind::Timeout,
        io::ErrorKind::InvalidData => return ErrorKind::Protocol,
        _ => {}
    }

    let error_str = error.to_string().to_lowercase();

    if error_str.contains("timed out") || error_str.contains("deadline") {
        return ErrorKind::Timeout;
    }

    if error_str.contains("tls")
        || error_str.contains("certificate")
        || error_str.contains("handshake")
    {
        return ErrorKind::Tls;
    }

    ErrorKind::Tunnel
}

/// Geolocation failed on every candidate endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeoError {
    /// All candidates were tried and none returned a usable answer.
    Exhausted {
        /// Number of candidates tried.
        attempts: usize,
    },
}

impl fmt::Display for GeoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeoError::Exhausted { attempts } => write!(
                f,
                "all {} geolocation endpoints failed or returned invalid data",
                attempts
            ),
        }
    }
}

impl Error for GeoError {}
