use thiserror::Error;

/// Raised while compiling node/mark declarations into a [`crate::Schema`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("duplicate node type `{0}`")]
    DuplicateNode(String),
    #[error("duplicate mark type `{0}`")]
    DuplicateMark(String),
    #[error("duplicate command id `{0}`")]
    DuplicateCommand(String),
    #[error("duplicate query id `{0}`")]
    DuplicateQuery(String),
    #[error("content expression `{expr}` references unknown name `{name}`")]
    UnknownContentRef { expr: String, name: String },
    #[error("malformed content expression `{expr}`: {reason}")]
    MalformedContentExpr { expr: String, reason: String },
}

/// Raised when persisted or pasted JSON does not describe a valid document.
/// Callers are expected to fall back to plain text rather than crash.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown node type `{0}`")]
    UnknownNodeType(String),
    #[error("unknown mark type `{0}`")]
    UnknownMarkType(String),
    #[error("node `{kind}` has content violating its content expression")]
    InvalidContent { kind: String },
    #[error("marks are only valid on inline content")]
    MarksOnBlock,
    #[error("malformed document json: {0}")]
    Malformed(String),
}

/// A position outside the addressable range of the current document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("position {pos} out of range 0..={max}")]
pub struct OutOfRangeError {
    pub pos: usize,
    pub max: usize,
}

/// Raised while applying transaction steps. The whole transaction is
/// rejected; the committed document is never left partially mutated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error(transparent)]
    OutOfRange(#[from] OutOfRangeError),
    #[error("invalid step: {0}")]
    InvalidStep(String),
    #[error("step would leave `{kind}` with content violating its content expression")]
    SchemaViolation { kind: String },
    #[error("normalize passes did not converge")]
    NormalizeDidNotConverge,
}

/// A range-based operation was requested with nothing selected.
/// Surfaced to the UI as a disabled affordance, not a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("selection is empty")]
pub struct EmptySelectionError;

/// Failure of an asynchronous collaborator call (threads, votes,
/// directories, uploads). Never corrupts document state; safe to retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("external call failed: {message}")]
pub struct ExternalCallError {
    pub message: String,
    pub retryable: bool,
}

impl ExternalCallError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CommandError {
    message: String,
}

impl CommandError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct QueryError {
    message: String,
}

impl QueryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Failure inside one extension's derived-state reducer or decoration
/// computation. Isolated to that extension: logged, previous state kept.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ExtensionError {
    message: String,
}

impl ExtensionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}
