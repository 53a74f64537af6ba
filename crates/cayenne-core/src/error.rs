//! Error types for object graph operations.

use std::fmt;

/// The primary error type for all object graph operations.
#[derive(Debug)]
pub enum Error {
    /// Object ownership and registration violations
    Identity(IdentityError),
    /// Commit planning and execution failures
    Commit(CommitError),
    /// Fault resolution failures
    Fault(FaultError),
    /// Delete rule refused a delete
    DeleteDenied(DeleteDeniedError),
    /// Invalid entity or relationship mapping
    Mapping(MappingError),
    /// Errors reported by the data node
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Configuration errors
    Config(ConfigError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct IdentityError {
    pub kind: IdentityErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityErrorKind {
    /// Object already belongs to another context
    AlreadyRegistered,
    /// Relationship target is owned by a different context
    ForeignContext,
    /// Id is not registered in this context
    NotRegistered,
    /// Operation requires a permanent id
    TemporaryId,
    /// Entity is not mapped
    UnknownEntity,
    /// Attribute or relationship is not mapped
    UnknownProperty,
    /// Object is in a state that does not allow the operation
    InvalidState,
}

#[derive(Debug)]
pub struct CommitError {
    pub kind: CommitErrorKind,
    pub message: String,
    /// Objects involved in the failure, rendered with `ObjectId`'s `Display`.
    pub objects: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitErrorKind {
    /// Foreign key cycle without a nullable edge to break it
    CyclicDependency,
    /// New object has no primary key source
    PkNotGenerated,
    /// Snapshot version or row qualifier did not match
    OptimisticLock,
    /// Node did not return a key it was asked to generate
    MissingGeneratedKey,
}

#[derive(Debug)]
pub struct FaultError {
    pub kind: FaultErrorKind,
    pub object: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultErrorKind {
    /// Row for a HOLLOW object no longer exists
    ObjectNotFound,
    /// Foreign key points to a missing row
    DanglingReference,
}

#[derive(Debug)]
pub struct DeleteDeniedError {
    pub object: String,
    pub relationship: String,
}

#[derive(Debug)]
pub struct MappingError {
    pub entity: Option<String>,
    pub message: String,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub table: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Constraint violation (unique, foreign key, not null)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Transaction misuse (already finished, nested)
    Transaction,
    /// Other node failure
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub key: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Commit failure kind, if this is a commit error.
    pub fn commit_kind(&self) -> Option<CommitErrorKind> {
        match self {
            Error::Commit(c) => Some(c.kind),
            _ => None,
        }
    }

    /// Identity failure kind, if this is an identity error.
    pub fn identity_kind(&self) -> Option<IdentityErrorKind> {
        match self {
            Error::Identity(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Fault failure kind, if this is a fault error.
    pub fn fault_kind(&self) -> Option<FaultErrorKind> {
        match self {
            Error::Fault(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Is this a constraint violation reported by the node?
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Error::Query(q) if q.kind == QueryErrorKind::Constraint)
    }

    pub fn identity(kind: IdentityErrorKind, message: impl Into<String>) -> Self {
        Error::Identity(IdentityError {
            kind,
            message: message.into(),
        })
    }
}

impl IdentityError {
    pub fn new(kind: IdentityErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl CommitError {
    pub fn new(kind: CommitErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            objects: Vec::new(),
        }
    }

    pub fn with_objects<I, T>(mut self, objects: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: fmt::Display,
    {
        self.objects = objects.into_iter().map(|o| o.to_string()).collect();
        self
    }
}

impl QueryError {
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            table: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn on_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Identity(e) => write!(f, "Identity error: {}", e.message),
            Error::Commit(e) => write!(f, "Commit error: {}", e),
            Error::Fault(e) => write!(f, "Fault error: {}", e),
            Error::DeleteDenied(e) => write!(f, "Delete denied: {}", e),
            Error::Mapping(e) => write!(f, "Mapping error: {}", e),
            Error::Query(e) => write!(f, "Query error: {}", e),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for CommitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.objects.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{} [{}]", self.message, self.objects.join(", "))
        }
    }
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.object)
    }
}

impl fmt::Display for DeleteDeniedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} still has related objects through '{}'",
            self.object, self.relationship
        )
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity {
            Some(entity) => write!(f, "{}: {}", entity, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table {
            Some(table) => write!(f, "{} (table {})", self.message, table),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{}: {}", key, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl From<IdentityError> for Error {
    fn from(err: IdentityError) -> Self {
        Error::Identity(err)
    }
}

impl From<CommitError> for Error {
    fn from(err: CommitError) -> Self {
        Error::Commit(err)
    }
}

impl From<FaultError> for Error {
    fn from(err: FaultError) -> Self {
        Error::Fault(err)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for object graph operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_error_lists_objects() {
        let err = Error::Commit(
            CommitError::new(CommitErrorKind::CyclicDependency, "cannot order inserts")
                .with_objects(["A<tmp:1>", "B<tmp:2>"]),
        );
        assert_eq!(err.commit_kind(), Some(CommitErrorKind::CyclicDependency));
        assert_eq!(
            err.to_string(),
            "Commit error: cannot order inserts [A<tmp:1>, B<tmp:2>]"
        );
    }

    #[test]
    fn kind_accessors() {
        let err = Error::identity(IdentityErrorKind::ForeignContext, "wrong context");
        assert_eq!(err.identity_kind(), Some(IdentityErrorKind::ForeignContext));
        assert_eq!(err.commit_kind(), None);

        let err = Error::Query(QueryError::new(QueryErrorKind::Constraint, "fk").on_table("painting"));
        assert!(err.is_constraint_violation());
        assert_eq!(err.to_string(), "Query error: fk (table painting)");
    }
}
