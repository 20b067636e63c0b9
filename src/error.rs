use std::fmt;
use std::io;

/// Stable error code carried through every channel and bootstrap callback.
///
/// Codes form a flat integer namespace so they can cross FFI-ish boundaries
/// (statistics sinks, logs) without losing identity. `0` is success; TLS
/// codes live in their own range so [`ErrorCode::is_tls`] can classify any
/// TLS-origin failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const SUCCESS: ErrorCode = ErrorCode(0);

    pub const SOCKET_CLOSED: ErrorCode = ErrorCode(1000);
    pub const SOCKET_TIMEOUT: ErrorCode = ErrorCode(1001);
    pub const SOCKET_CONNECTION_REFUSED: ErrorCode = ErrorCode(1002);
    pub const SOCKET_ADDRESS_IN_USE: ErrorCode = ErrorCode(1003);
    pub const SOCKET_INVALID_ADDRESS: ErrorCode = ErrorCode(1004);
    pub const SOCKET_ERROR: ErrorCode = ErrorCode(1005);

    pub const EVENT_LOOP_SHUTDOWN: ErrorCode = ErrorCode(1100);
    pub const CHANNEL_SHUT_DOWN: ErrorCode = ErrorCode(1101);
    pub const READ_WINDOW_EXCEEDED: ErrorCode = ErrorCode(1102);
    pub const TASK_CANCELED: ErrorCode = ErrorCode(1103);
    pub const UNKNOWN: ErrorCode = ErrorCode(1104);
    pub const INVALID_STATE: ErrorCode = ErrorCode(1105);

    pub const DNS_RESOLVE_FAILURE: ErrorCode = ErrorCode(1200);

    pub const TLS_NEGOTIATION_FAILURE: ErrorCode = ErrorCode(2000);
    pub const TLS_NEGOTIATION_TIMEOUT: ErrorCode = ErrorCode(2001);
    pub const TLS_ALERT_RECEIVED: ErrorCode = ErrorCode(2002);
    pub const TLS_CTX_ERROR: ErrorCode = ErrorCode(2003);
    pub const TLS_WRITE_FAILURE: ErrorCode = ErrorCode(2004);

    /// Whether this code represents success.
    #[inline]
    pub fn is_ok(self) -> bool {
        self == Self::SUCCESS
    }

    /// Whether this code originated in the TLS subsystem.
    #[inline]
    pub fn is_tls(self) -> bool {
        (2000..3000).contains(&self.0)
    }

    /// Stable human-readable name for logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::SUCCESS => "success",
            Self::SOCKET_CLOSED => "socket closed",
            Self::SOCKET_TIMEOUT => "socket timeout",
            Self::SOCKET_CONNECTION_REFUSED => "connection refused",
            Self::SOCKET_ADDRESS_IN_USE => "address in use",
            Self::SOCKET_INVALID_ADDRESS => "invalid address",
            Self::SOCKET_ERROR => "socket error",
            Self::EVENT_LOOP_SHUTDOWN => "event loop shut down",
            Self::CHANNEL_SHUT_DOWN => "channel shut down",
            Self::READ_WINDOW_EXCEEDED => "read window exceeded",
            Self::TASK_CANCELED => "task canceled",
            Self::INVALID_STATE => "invalid state",
            Self::DNS_RESOLVE_FAILURE => "dns resolution failure",
            Self::TLS_NEGOTIATION_FAILURE => "tls negotiation failure",
            Self::TLS_NEGOTIATION_TIMEOUT => "tls negotiation timeout",
            Self::TLS_ALERT_RECEIVED => "tls alert received",
            Self::TLS_CTX_ERROR => "tls context error",
            Self::TLS_WRITE_FAILURE => "tls write failure",
            _ => "unknown",
        }
    }

    /// Map an `io::Error` to the closest stable code.
    pub fn from_io(err: &io::Error) -> ErrorCode {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Self::SOCKET_CLOSED,
            io::ErrorKind::TimedOut => Self::SOCKET_TIMEOUT,
            io::ErrorKind::ConnectionRefused => Self::SOCKET_CONNECTION_REFUSED,
            io::ErrorKind::AddrInUse => Self::SOCKET_ADDRESS_IN_USE,
            io::ErrorKind::AddrNotAvailable | io::ErrorKind::InvalidInput => {
                Self::SOCKET_INVALID_ADDRESS
            }
            _ => Self::SOCKET_ERROR,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

/// Error returned by fallible loomio APIs.
///
/// Carries the stable code plus the underlying `io::Error` when one exists.
#[derive(Debug)]
pub struct Error {
    code: ErrorCode,
    source: Option<io::Error>,
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        Error { code, source: None }
    }

    pub fn with_source(code: ErrorCode, source: io::Error) -> Self {
        Error {
            code,
            source: Some(source),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{}: {src}", self.code),
            None => write!(f, "{}", self.code),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e as _)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error {
            code: ErrorCode::from_io(&e),
            source: Some(e),
        }
    }
}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Error::new(code)
    }
}
