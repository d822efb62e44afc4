use std::fmt;

/// Failure classification shared by every error the multiplexer surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    ProtocolViolation,
    SocketFailure,
    Timeout,
    AuthenticationFailure,
    CommandRejected,
    NoConnectionAvailable,
    CrossSlot,
    AdminNotPermitted,
    MasterOnly,
    Disposed,
    Configuration,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::ProtocolViolation => "protocol",
            FailureKind::SocketFailure => "socket",
            FailureKind::Timeout => "timeout",
            FailureKind::AuthenticationFailure => "auth",
            FailureKind::CommandRejected => "rejected",
            FailureKind::NoConnectionAvailable => "no_connection",
            FailureKind::CrossSlot => "cross_slot",
            FailureKind::AdminNotPermitted => "admin",
            FailureKind::MasterOnly => "master_only",
            FailureKind::Disposed => "disposed",
            FailureKind::Configuration => "config",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic state of a physical connection at the moment it failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionContext {
    pub endpoint: String,
    pub queue_depth: usize,
    pub pending: usize,
    pub since_read_ms: Option<u64>,
    pub since_write_ms: Option<u64>,
    /// How long the oldest unanswered message had been waiting.
    pub oldest_pending_ms: Option<u64>,
}

impl ConnectionContext {
    pub fn for_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }
}

impl fmt::Display for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "endpoint={} queue={} pending={}",
            self.endpoint, self.queue_depth, self.pending
        )?;
        if let Some(ms) = self.since_read_ms {
            write!(f, " last-read={ms}ms")?;
        }
        if let Some(ms) = self.since_write_ms {
            write!(f, " last-write={ms}ms")?;
        }
        if let Some(ms) = self.oldest_pending_ms {
            write!(f, " oldest-pending={ms}ms")?;
        }
        Ok(())
    }
}

/// Errors delivered to callers of the multiplexer.
///
/// Connection-fatal failures fan out to every message queued or pending on
/// the failed connection, hence `Clone`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MuxError {
    #[error("protocol violation: {message} ({context})")]
    ProtocolViolation {
        message: String,
        context: ConnectionContext,
    },

    #[error("socket failure: {message} ({context})")]
    SocketFailure {
        message: String,
        context: ConnectionContext,
    },

    #[error("timeout performing {command} after {elapsed_ms}ms")]
    Timeout { command: String, elapsed_ms: u64 },

    #[error("authentication failed on {endpoint}: {message}")]
    AuthenticationFailure { endpoint: String, message: String },

    #[error("{0}")]
    CommandRejected(String),

    #[error("no connection is available to service {command}; {status}")]
    NoConnectionAvailable { command: String, status: String },

    #[error("multi-key command {command} spans hash slots {first} and {second}")]
    CrossSlot {
        command: String,
        first: u16,
        second: u16,
    },

    #[error("{command} is an admin command; enable allow_admin to use it")]
    AdminNotPermitted { command: String },

    #[error("{command} can only be sent to a master; no master is selectable")]
    MasterOnly { command: String },

    #[error("connection disposed")]
    Disposed,

    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl MuxError {
    pub fn kind(&self) -> FailureKind {
        match self {
            MuxError::ProtocolViolation { .. } => FailureKind::ProtocolViolation,
            MuxError::SocketFailure { .. } => FailureKind::SocketFailure,
            MuxError::Timeout { .. } => FailureKind::Timeout,
            MuxError::AuthenticationFailure { .. } => FailureKind::AuthenticationFailure,
            MuxError::CommandRejected(_) => FailureKind::CommandRejected,
            MuxError::NoConnectionAvailable { .. } => FailureKind::NoConnectionAvailable,
            MuxError::CrossSlot { .. } => FailureKind::CrossSlot,
            MuxError::AdminNotPermitted { .. } => FailureKind::AdminNotPermitted,
            MuxError::MasterOnly { .. } => FailureKind::MasterOnly,
            MuxError::Disposed => FailureKind::Disposed,
            MuxError::Configuration(_) => FailureKind::Configuration,
        }
    }

    /// Whether this failure tears down the whole connection rather than a
    /// single message.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self.kind(),
            FailureKind::ProtocolViolation
                | FailureKind::SocketFailure
                | FailureKind::AuthenticationFailure
                | FailureKind::Disposed
        )
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        MuxError::ProtocolViolation {
            message: message.into(),
            context: ConnectionContext::default(),
        }
    }

    pub fn socket(message: impl Into<String>, context: ConnectionContext) -> Self {
        MuxError::SocketFailure {
            message: message.into(),
            context,
        }
    }

    /// Attach connection diagnostics to a connection-level failure.
    pub fn with_context(self, context: ConnectionContext) -> Self {
        match self {
            MuxError::ProtocolViolation { message, .. } => {
                MuxError::ProtocolViolation { message, context }
            }
            MuxError::SocketFailure { message, .. } => MuxError::SocketFailure { message, context },
            other => other,
        }
    }
}

impl From<std::io::Error> for MuxError {
    fn from(err: std::io::Error) -> Self {
        MuxError::socket(err.to_string(), ConnectionContext::default())
    }
}

pub type MuxResult<T> = std::result::Result<T, MuxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(MuxError::protocol("bad prefix").is_connection_fatal());
        assert!(MuxError::socket("eof", ConnectionContext::default()).is_connection_fatal());
        assert!(!MuxError::CommandRejected("ERR nope".into()).is_connection_fatal());
        assert!(!MuxError::CrossSlot {
            command: "MGET".into(),
            first: 1,
            second: 2
        }
        .is_connection_fatal());
    }

    #[test]
    fn context_renders_diagnostics() {
        let err = MuxError::socket(
            "connection reset",
            ConnectionContext {
                endpoint: "127.0.0.1:6379".into(),
                queue_depth: 3,
                pending: 2,
                since_read_ms: Some(15),
                since_write_ms: None,
                oldest_pending_ms: Some(1200),
            },
        );
        let text = err.to_string();
        assert!(text.contains("127.0.0.1:6379"));
        assert!(text.contains("queue=3"));
        assert!(text.contains("last-read=15ms"));
        assert!(text.contains("oldest-pending=1200ms"));
        assert_eq!(err.kind(), FailureKind::SocketFailure);
    }

    #[test]
    fn with_context_only_touches_connection_errors() {
        let ctx = ConnectionContext::for_endpoint("a:1");
        match MuxError::protocol("x").with_context(ctx.clone()) {
            MuxError::ProtocolViolation { context, .. } => assert_eq!(context, ctx),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            MuxError::Disposed.with_context(ctx),
            MuxError::Disposed
        ));
    }
}
