pub mod context;

pub use context::ErrorContext;

/// Errors raised by the correlation and scheduling core.
///
/// The first six kinds are the ones surfaced to collaborators. The wrapping
/// kinds keep the store-level error that caused them as `source`, so a
/// restart policy can still see e.g. a concurrency conflict after context has
/// been added on the way up.
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("Creation error: {message}")]
    CreationError {
        message: String,
        #[source]
        source: Option<Box<AppError>>,
    },

    #[error("Read error: {message}")]
    ReadError {
        message: String,
        #[source]
        source: Option<Box<AppError>>,
    },

    #[error("Modification error: {message}")]
    ModificationError {
        message: String,
        #[source]
        source: Option<Box<AppError>>,
    },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Execution error: {message}")]
    ExecutionError {
        message: String,
        #[source]
        source: Option<Box<AppError>>,
    },

    #[error("Scheduler error: {message}")]
    SchedulerError {
        message: String,
        #[source]
        source: Option<Box<AppError>>,
    },

    // Store-level errors raised by the persistence façade and the transaction coordinator
    #[error("Write error: {0}")]
    WriteError(String),

    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),
}

impl AppError {
    pub fn creation(message: impl Into<String>) -> Self {
        AppError::CreationError { message: message.into(), source: None }
    }

    pub fn read(message: impl Into<String>) -> Self {
        AppError::ReadError { message: message.into(), source: None }
    }

    pub fn modification(message: impl Into<String>) -> Self {
        AppError::ModificationError { message: message.into(), source: None }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        AppError::ExecutionError { message: message.into(), source: None }
    }

    pub fn scheduler(message: impl Into<String>) -> Self {
        AppError::SchedulerError { message: message.into(), source: None }
    }

    /// Attach the error that caused this one. Leaf kinds have no source slot
    /// and are returned unchanged.
    pub fn with_source(mut self, cause: AppError) -> Self {
        match &mut self {
            AppError::CreationError { source, .. }
            | AppError::ReadError { source, .. }
            | AppError::ModificationError { source, .. }
            | AppError::ExecutionError { source, .. }
            | AppError::SchedulerError { source, .. } => *source = Some(Box::new(cause)),
            _ => {}
        }
        self
    }

    /// The wrapped cause, if any.
    pub fn cause(&self) -> Option<&AppError> {
        match self {
            AppError::CreationError { source, .. }
            | AppError::ReadError { source, .. }
            | AppError::ModificationError { source, .. }
            | AppError::ExecutionError { source, .. }
            | AppError::SchedulerError { source, .. } => source.as_deref(),
            _ => None,
        }
    }

    /// Innermost error of the chain.
    pub fn root_cause(&self) -> &AppError {
        let mut current = self;
        while let Some(next) = current.cause() {
            current = next;
        }
        current
    }

    /// Whether any error in the chain satisfies `predicate`.
    pub fn any_in_chain(&self, predicate: impl Fn(&AppError) -> bool) -> bool {
        let mut current = Some(self);
        while let Some(error) = current {
            if predicate(error) {
                return true;
            }
            current = error.cause();
        }
        false
    }

    pub fn is_concurrency_conflict(&self) -> bool {
        self.any_in_chain(|e| matches!(e, AppError::ConcurrencyConflict(_)))
    }

    pub fn is_not_found(&self) -> bool {
        self.any_in_chain(|e| matches!(e, AppError::NotFound(_)))
    }

    /// Short kind label used in logs and job logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::CreationError { .. } => "CreationError",
            AppError::ReadError { .. } => "ReadError",
            AppError::ModificationError { .. } => "ModificationError",
            AppError::ConfigurationError(_) => "ConfigurationError",
            AppError::ExecutionError { .. } => "ExecutionError",
            AppError::SchedulerError { .. } => "SchedulerError",
            AppError::WriteError(_) => "WriteError",
            AppError::ConcurrencyConflict(_) => "ConcurrencyConflict",
            AppError::NotFound(_) => "NotFound",
            AppError::TransactionError(_) => "TransactionError",
        }
    }

    /// Message of the error followed by the messages of its causes.
    pub fn full_message(&self) -> String {
        let mut message = self.to_string();
        let mut current = self.cause();
        while let Some(cause) = current {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            current = cause.cause();
        }
        message
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::read(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        AppError::ConfigurationError(format!("YAML error: {}", err))
    }
}

impl From<cron::error::Error> for AppError {
    fn from(err: cron::error::Error) -> Self {
        AppError::scheduler(format!("Invalid cron expression: {}", err))
    }
}

impl From<mongodb::error::Error> for AppError {
    fn from(err: mongodb::error::Error) -> Self {
        AppError::read(format!("MongoDB error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Adds context to a failed result while keeping the original error as source.
pub trait ResultExt<T> {
    fn or_wrap(self, wrap: impl FnOnce() -> AppError) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn or_wrap(self, wrap: impl FnOnce() -> AppError) -> Result<T> {
        self.map_err(|cause| wrap().with_source(cause))
    }
}
