//! Command type exchanged between supervisor and worker.

use bytes::Bytes;

/// Wire token for a cache lookup (request and reply).
pub const TOKEN_GET: &str = "[get]";
/// Wire token for a cache store.
pub const TOKEN_PUT: &str = "[put]";
/// Wire token for a cache removal.
pub const TOKEN_DELETE: &str = "[delete]";
/// Wire token asking the worker to shut down.
pub const TOKEN_TERMINATE: &str = "[terminate]";

/// Command kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Cache lookup; the supervisor answers with a `Get` carrying the bytes
    Get,
    /// Cache store (fire-and-forget)
    Put,
    /// Cache removal (fire-and-forget)
    Delete,
    /// Graceful shutdown request, handled by the worker itself
    Terminate,
    /// Free-form text line from the worker's logger
    LogLine,
}

impl CommandKind {
    /// Wire token for framed kinds. Log lines have none.
    pub fn token(&self) -> Option<&'static str> {
        match self {
            CommandKind::Get => Some(TOKEN_GET),
            CommandKind::Put => Some(TOKEN_PUT),
            CommandKind::Delete => Some(TOKEN_DELETE),
            CommandKind::Terminate => Some(TOKEN_TERMINATE),
            CommandKind::LogLine => None,
        }
    }

    /// Parse a framed kind from its wire token.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            TOKEN_GET => Some(CommandKind::Get),
            TOKEN_PUT => Some(CommandKind::Put),
            TOKEN_DELETE => Some(CommandKind::Delete),
            TOKEN_TERMINATE => Some(CommandKind::Terminate),
            _ => None,
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandKind::Get => write!(f, "get"),
            CommandKind::Put => write!(f, "put"),
            CommandKind::Delete => write!(f, "delete"),
            CommandKind::Terminate => write!(f, "terminate"),
            CommandKind::LogLine => write!(f, "log"),
        }
    }
}

/// A single message on the command channel.
///
/// For [`CommandKind::LogLine`] the `name` field holds the line text and the
/// payload is always empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    kind: CommandKind,
    name: String,
    payload: Bytes,
}

impl Command {
    /// Create a command from its parts.
    pub fn new(kind: CommandKind, name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            name: name.into(),
            payload: payload.into(),
        }
    }

    /// Cache lookup request.
    pub fn get(name: impl Into<String>) -> Self {
        Self::new(CommandKind::Get, name, Bytes::new())
    }

    /// Cache lookup reply. An empty payload means "not found".
    pub fn get_reply(name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::new(CommandKind::Get, name, payload)
    }

    pub fn put(name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::new(CommandKind::Put, name, payload)
    }

    pub fn delete(name: impl Into<String>) -> Self {
        Self::new(CommandKind::Delete, name, Bytes::new())
    }

    pub fn terminate() -> Self {
        Self::new(CommandKind::Terminate, String::new(), Bytes::new())
    }

    /// Worker log line forwarded to the supervisor's logger.
    pub fn log_line(text: impl Into<String>) -> Self {
        Self::new(CommandKind::LogLine, text, Bytes::new())
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consume the command and return its payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}
