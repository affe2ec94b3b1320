//! Error classification for storage and migration failures
//!
//! Every failure that leaves this crate is a [`ClassifiedError`]: a stable
//! [`ErrorKind`], a caller-facing status class, a message safe to show to end
//! users and an operational flag telling callers whether the failure is an
//! expected runtime condition or a bug/misconfiguration.
//!
//! Raw failures enter through [`RawFailure`] (built from `sqlx::Error`,
//! `std::io::Error` or by hand) and are mapped by [`classify`].

use chrono::{DateTime, Utc};
use sqlx::postgres::PgDatabaseError;
use std::fmt;

/// ORM error type alias
pub type OrmError = ClassifiedError;

/// ORM result type alias
pub type OrmResult<T> = Result<T, OrmError>;

/// Caller-facing failure class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusClass {
    BadRequest,
    Conflict,
    Unauthorized,
    NotFound,
    Unprocessable,
    ServerError,
    Unavailable,
}

impl StatusClass {
    /// HTTP status number for callers behind an HTTP boundary
    pub fn http_status(&self) -> u16 {
        match self {
            StatusClass::BadRequest => 400,
            StatusClass::Unauthorized => 401,
            StatusClass::NotFound => 404,
            StatusClass::Conflict => 409,
            StatusClass::Unprocessable => 422,
            StatusClass::ServerError => 500,
            StatusClass::Unavailable => 503,
        }
    }
}

impl fmt::Display for StatusClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusClass::BadRequest => "bad_request",
            StatusClass::Conflict => "conflict",
            StatusClass::Unauthorized => "unauthorized",
            StatusClass::NotFound => "not_found",
            StatusClass::Unprocessable => "unprocessable",
            StatusClass::ServerError => "server_error",
            StatusClass::Unavailable => "unavailable",
        };
        write!(f, "{}", name)
    }
}

/// Integrity constraint families reported by the storage engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintKind {
    Unique,
    ForeignKey,
    NotNull,
    Check,
}

/// Stable failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PoolExhausted,
    PoolClosed,
    ConstraintViolation(ConstraintKind),
    SchemaDrift,
    ConnectivityLoss,
    Misconfiguration,
    ServerShutdown,
    UnclassifiedStorageError,
    NoMigrationsApplied,
    NoRollbackSection,
    MigrationAlreadyApplied,
    MigrationFileMissing,
    InvalidMigration,
    Unexpected,
}

impl ErrorKind {
    pub fn status_class(&self) -> StatusClass {
        match self {
            ErrorKind::ConstraintViolation(ConstraintKind::Unique) => StatusClass::Conflict,
            ErrorKind::ConstraintViolation(_) => StatusClass::BadRequest,
            ErrorKind::PoolExhausted | ErrorKind::ConnectivityLoss | ErrorKind::ServerShutdown => {
                StatusClass::Unavailable
            }
            ErrorKind::NoMigrationsApplied | ErrorKind::MigrationFileMissing => {
                StatusClass::NotFound
            }
            ErrorKind::NoRollbackSection | ErrorKind::InvalidMigration => {
                StatusClass::Unprocessable
            }
            ErrorKind::MigrationAlreadyApplied => StatusClass::Conflict,
            ErrorKind::PoolClosed
            | ErrorKind::SchemaDrift
            | ErrorKind::Misconfiguration
            | ErrorKind::UnclassifiedStorageError
            | ErrorKind::Unexpected => StatusClass::ServerError,
        }
    }

    /// Operational failures are expected runtime conditions, not bugs
    pub fn is_operational(&self) -> bool {
        match self {
            ErrorKind::ConstraintViolation(_)
            | ErrorKind::PoolExhausted
            | ErrorKind::ConnectivityLoss
            | ErrorKind::ServerShutdown
            | ErrorKind::NoMigrationsApplied
            | ErrorKind::NoRollbackSection
            | ErrorKind::MigrationAlreadyApplied
            | ErrorKind::InvalidMigration => true,
            ErrorKind::PoolClosed
            | ErrorKind::SchemaDrift
            | ErrorKind::Misconfiguration
            | ErrorKind::UnclassifiedStorageError
            | ErrorKind::MigrationFileMissing
            | ErrorKind::Unexpected => false,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::ConstraintViolation(constraint) => {
                write!(f, "ConstraintViolation({:?})", constraint)
            }
            other => write!(f, "{:?}", other),
        }
    }
}

/// A failure after classification.
///
/// Fields are fixed at construction; builders return a new value.
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    timestamp: DateTime<Utc>,
    message: String,
    status_class: StatusClass,
    is_operational: bool,
    source_code: Option<String>,
    kind: ErrorKind,
    detail: Option<String>,
    constraint: Option<String>,
    context: Option<String>,
}

impl ClassifiedError {
    /// Create an error whose status class and operational flag follow from `kind`
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
            status_class: kind.status_class(),
            is_operational: kind.is_operational(),
            source_code: None,
            kind,
            detail: None,
            constraint: None,
            context: None,
        }
    }

    pub fn pool_exhausted(timeout: std::time::Duration) -> Self {
        Self::new(
            ErrorKind::PoolExhausted,
            "No database connection became available in time",
        )
        .with_detail(format!("acquire timed out after {:?}", timeout))
    }

    pub fn pool_closed() -> Self {
        Self::new(ErrorKind::PoolClosed, "The connection pool has been closed")
    }

    pub fn no_migrations_applied() -> Self {
        Self::new(
            ErrorKind::NoMigrationsApplied,
            "No migrations have been applied",
        )
    }

    pub fn no_rollback_section(filename: &str) -> Self {
        Self::new(
            ErrorKind::NoRollbackSection,
            format!("Migration {} has no rollback section", filename),
        )
    }

    pub fn migration_already_applied(filename: &str) -> Self {
        Self::new(
            ErrorKind::MigrationAlreadyApplied,
            format!("Migration {} has already been applied", filename),
        )
    }

    pub fn migration_file_missing(filename: &str) -> Self {
        Self::new(
            ErrorKind::MigrationFileMissing,
            format!("Migration file {} was not found", filename),
        )
    }

    pub fn invalid_migration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidMigration, message)
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unexpected, message)
    }

    pub fn with_source_code(mut self, code: impl Into<String>) -> Self {
        self.source_code = Some(code.into());
        self
    }

    /// Attach driver-level detail. Kept out of `message`.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraint = Some(constraint.into());
        self
    }

    /// Prefix the displayed message with what was being attempted
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status_class(&self) -> StatusClass {
        self.status_class
    }

    pub fn is_operational(&self) -> bool {
        self.is_operational
    }

    pub fn source_code(&self) -> Option<&str> {
        self.source_code.as_deref()
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    pub fn constraint(&self) -> Option<&str> {
        self.constraint.as_deref()
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::PoolExhausted | ErrorKind::ConnectivityLoss | ErrorKind::ServerShutdown
        )
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(context) => write!(f, "{}: {}", context, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ClassifiedError {}

/// Failure as produced at a boundary, before classification
#[derive(Debug, Clone)]
pub enum RawFailure {
    /// Already classified; passes through unchanged
    Classified(ClassifiedError),
    /// Storage-engine failure carrying a SQLSTATE code
    Storage {
        code: String,
        message: String,
        detail: Option<String>,
        constraint: Option<String>,
    },
    Generic {
        message: String,
    },
    Unknown {
        value: Option<String>,
    },
}

impl RawFailure {
    pub fn storage(code: impl Into<String>, message: impl Into<String>) -> Self {
        RawFailure::Storage {
            code: code.into(),
            message: message.into(),
            detail: None,
            constraint: None,
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        RawFailure::Generic {
            message: message.into(),
        }
    }

    pub fn unknown(value: Option<String>) -> Self {
        RawFailure::Unknown { value }
    }
}

impl From<ClassifiedError> for RawFailure {
    fn from(err: ClassifiedError) -> Self {
        RawFailure::Classified(err)
    }
}

impl From<sqlx::Error> for RawFailure {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => match db_err.code() {
                Some(code) => RawFailure::Storage {
                    code: code.into_owned(),
                    message: db_err.message().to_string(),
                    detail: db_err
                        .try_downcast_ref::<PgDatabaseError>()
                        .and_then(|pg| pg.detail())
                        .map(str::to_string),
                    constraint: db_err.constraint().map(str::to_string),
                },
                None => RawFailure::generic(db_err.message()),
            },
            sqlx::Error::PoolTimedOut => RawFailure::Classified(ClassifiedError::new(
                ErrorKind::PoolExhausted,
                "No database connection became available in time",
            )),
            sqlx::Error::PoolClosed => RawFailure::Classified(ClassifiedError::pool_closed()),
            sqlx::Error::Io(io_err) => RawFailure::Classified(
                ClassifiedError::new(ErrorKind::ConnectivityLoss, "Database connection error")
                    .with_detail(io_err.to_string()),
            ),
            sqlx::Error::Tls(tls_err) => RawFailure::Classified(
                ClassifiedError::new(ErrorKind::ConnectivityLoss, "Database connection error")
                    .with_detail(tls_err.to_string()),
            ),
            sqlx::Error::Configuration(config_err) => RawFailure::Classified(
                ClassifiedError::new(
                    ErrorKind::Misconfiguration,
                    "Invalid database configuration",
                )
                .with_detail(config_err.to_string()),
            ),
            other => RawFailure::generic(other.to_string()),
        }
    }
}

impl From<std::io::Error> for RawFailure {
    fn from(err: std::io::Error) -> Self {
        RawFailure::generic(err.to_string())
    }
}

const UNEXPECTED_STORAGE_MESSAGE: &str = "An unexpected database error occurred";
const UNEXPECTED_MESSAGE: &str = "An unexpected error occurred";

/// Map a raw failure onto the error taxonomy. Total: never fails.
pub fn classify(raw: impl Into<RawFailure>) -> ClassifiedError {
    match raw.into() {
        RawFailure::Classified(err) => err,
        RawFailure::Storage {
            code,
            message,
            detail,
            constraint,
        } => {
            if code.chars().count() != 5 {
                return classify_message(Some(message));
            }
            classify_storage(code, message, detail, constraint)
        }
        RawFailure::Generic { message } => classify_message(Some(message)),
        RawFailure::Unknown { value } => classify_message(value),
    }
}

fn classify_storage(
    code: String,
    message: String,
    detail: Option<String>,
    constraint: Option<String>,
) -> ClassifiedError {
    let (kind, public_message) = match code.as_str() {
        "23505" => (
            ErrorKind::ConstraintViolation(ConstraintKind::Unique),
            "A record with this value already exists",
        ),
        "23503" => (
            ErrorKind::ConstraintViolation(ConstraintKind::ForeignKey),
            "This operation violates a foreign key constraint",
        ),
        "23502" => (
            ErrorKind::ConstraintViolation(ConstraintKind::NotNull),
            "Required field is missing",
        ),
        "23514" => (
            ErrorKind::ConstraintViolation(ConstraintKind::Check),
            "The value violates a check constraint",
        ),
        "42P01" => (ErrorKind::SchemaDrift, "The requested table does not exist"),
        "42703" => (ErrorKind::SchemaDrift, "The requested column does not exist"),
        "42883" => (ErrorKind::SchemaDrift, "The requested function does not exist"),
        "08006" | "53300" => (ErrorKind::ConnectivityLoss, "Database connection error"),
        "28P01" => (ErrorKind::Misconfiguration, "Invalid database credentials"),
        "57P01" | "57P02" => (
            ErrorKind::ServerShutdown,
            "Database server is currently unavailable",
        ),
        _ => (ErrorKind::UnclassifiedStorageError, UNEXPECTED_STORAGE_MESSAGE),
    };

    let driver_detail = match detail {
        Some(detail) if !detail.is_empty() => format!("{} ({})", message, detail),
        _ => message,
    };

    let mut classified = ClassifiedError::new(kind, public_message)
        .with_source_code(code)
        .with_detail(driver_detail);
    if let Some(constraint) = constraint {
        classified = classified.with_constraint(constraint);
    }
    classified
}

fn classify_message(message: Option<String>) -> ClassifiedError {
    match message {
        Some(message) if !message.trim().is_empty() => ClassifiedError::unexpected(message),
        _ => ClassifiedError::unexpected(UNEXPECTED_MESSAGE),
    }
}

impl From<sqlx::Error> for ClassifiedError {
    fn from(err: sqlx::Error) -> Self {
        classify(err)
    }
}

impl From<std::io::Error> for ClassifiedError {
    fn from(err: std::io::Error) -> Self {
        classify(err)
    }
}

/// Log a classified error: operational failures at warn, everything else at error
pub fn report(err: &ClassifiedError) {
    let code = err.source_code().unwrap_or("-");
    if err.is_operational() {
        tracing::warn!(
            kind = %err.kind(),
            status = err.status_class().http_status(),
            code = code,
            timestamp = %err.timestamp(),
            "{}",
            err
        );
    } else {
        tracing::error!(
            kind = %err.kind(),
            status = err.status_class().http_status(),
            code = code,
            timestamp = %err.timestamp(),
            detail = err.detail().unwrap_or("-"),
            "{}",
            err
        );
    }
}
