//! Error taxonomy for the experiment pipeline.
//!
//! Every failure surfaced by this crate is one of the closed variants below.
//! Each carries a human-readable message and, once it has passed through the
//! state machine, the `ExperimentState` it occurred in. Display/Error are
//! hand-written rather than derived so the message text stays exactly what
//! callers are meant to log.

use core::fmt;

use crate::experiment::ExperimentState;

/// Sub-kind of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    Connect,
    Timeout,
    Upload,
    Download,
    Truncated,
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connect => "connect",
            Self::Timeout => "timeout",
            Self::Upload => "upload",
            Self::Download => "download",
            Self::Truncated => "truncated",
        };
        write!(f, "{s}")
    }
}

/// Sub-kind of a well-formed-but-unactionable server response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    MalformedResponse,
    Rejected,
    UnknownCode,
    VersionMismatch,
}

impl fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MalformedResponse => "malformed_response",
            Self::Rejected => "rejected",
            Self::UnknownCode => "unknown_code",
            Self::VersionMismatch => "version_mismatch",
        };
        write!(f, "{s}")
    }
}

/// Sub-kind of a crypto (or crypto I/O) failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionErrorKind {
    Key,
    KeyWrap,
    Seal,
    Open,
    Kdf,
    Io,
}

impl fmt::Display for EncryptionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Key => "key",
            Self::KeyWrap => "key_wrap",
            Self::Seal => "seal",
            Self::Open => "open",
            Self::Kdf => "kdf",
            Self::Io => "io",
        };
        write!(f, "{s}")
    }
}

/// Sub-kind of a summary-report parsing failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportErrorKind {
    MissingField,
    Parse,
}

impl fmt::Display for ReportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MissingField => "missing_field",
            Self::Parse => "parse",
        };
        write!(f, "{s}")
    }
}

/// The closed set of failures an `Experiment::run` can produce.
#[derive(Debug)]
pub enum ExperimentError {
    InvalidInput {
        reason: String,
    },
    Auth,
    Network {
        kind: NetworkErrorKind,
        message: String,
        phase: Option<ExperimentState>,
    },
    Protocol {
        kind: ProtocolErrorKind,
        message: String,
        phase: Option<ExperimentState>,
    },
    ServiceUnavailable {
        message: String,
    },
    Encryption {
        kind: EncryptionErrorKind,
        message: String,
        phase: Option<ExperimentState>,
    },
    Packaging {
        message: String,
        phase: Option<ExperimentState>,
    },
    Report {
        kind: ReportErrorKind,
        message: String,
    },
    Timeout,
    Cancelled,
    Internal {
        message: String,
    },
}

impl ExperimentError {
    /// Attach (or overwrite) the state-machine phase a failure occurred in.
    pub fn with_phase(mut self, phase: ExperimentState) -> Self {
        match &mut self {
            Self::Network { phase: p, .. }
            | Self::Protocol { phase: p, .. }
            | Self::Encryption { phase: p, .. }
            | Self::Packaging { phase: p, .. } => *p = Some(phase),
            _ => {}
        }
        self
    }

    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput { reason: reason.into() }
    }

    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        Self::Network { kind, message: message.into(), phase: None }
    }

    pub fn protocol(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self::Protocol { kind, message: message.into(), phase: None }
    }

    pub fn encryption(kind: EncryptionErrorKind, message: impl Into<String>) -> Self {
        Self::Encryption { kind, message: message.into(), phase: None }
    }

    pub fn packaging(message: impl Into<String>) -> Self {
        Self::Packaging { message: message.into(), phase: None }
    }

    pub fn report(kind: ReportErrorKind, message: impl Into<String>) -> Self {
        Self::Report { kind, message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Kind tag, matching spec's closed set of error kinds.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "invalid_input",
            Self::Auth => "auth",
            Self::Network { .. } => "network",
            Self::Protocol { .. } => "protocol",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::Encryption { .. } => "encryption",
            Self::Packaging { .. } => "packaging",
            Self::Report { .. } => "report",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Internal { .. } => "internal",
        }
    }
}

impl fmt::Display for ExperimentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput { reason } => write!(f, "invalid input: {reason}"),
            Self::Auth => write!(f, "authentication rejected"),
            Self::Network { kind, message, phase } => {
                write!(f, "{kind}: {message}")?;
                if let Some(phase) = phase {
                    write!(f, " (during {phase})")?;
                }
                Ok(())
            }
            Self::Protocol { kind, message, phase } => {
                write!(f, "protocol {kind}: {message}")?;
                if let Some(phase) = phase {
                    write!(f, " (during {phase})")?;
                }
                Ok(())
            }
            Self::ServiceUnavailable { message } => write!(f, "service unavailable: {message}"),
            Self::Encryption { kind, message, phase } => {
                write!(f, "encryption {kind}: {message}")?;
                if let Some(phase) = phase {
                    write!(f, " (during {phase})")?;
                }
                Ok(())
            }
            Self::Packaging { message, phase } => {
                write!(f, "packaging: {message}")?;
                if let Some(phase) = phase {
                    write!(f, " (during {phase})")?;
                }
                Ok(())
            }
            Self::Report { kind, message } => write!(f, "report {kind}: {message}"),
            Self::Timeout => write!(f, "polling deadline exceeded"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Internal { message } => write!(f, "internal error: {message} (this is a bug)"),
        }
    }
}

impl std::error::Error for ExperimentError {}
