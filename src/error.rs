use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("unsupported database url: {0} (only sqlite is supported)")]
    UnsupportedUrl(String),

    #[error("database runtime unavailable: {0}")]
    Runtime(String),

    #[error("corrupt row in {table}: {detail}")]
    CorruptRow { table: &'static str, detail: String },
}

/// Errors surfaced by task operations on the synchronous request path.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0}")]
    Validation(String),

    #[error("task {0} not found")]
    NotFound(i64),

    #[error("all {capacity} upgrade slots are busy, retry later")]
    Busy { capacity: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TaskError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not-found",
            Self::Busy { .. } => "busy",
            Self::Store(_) => "persistence",
        }
    }

    pub fn status(&self) -> (u16, &'static str) {
        match self {
            Self::Validation(_) => (400, "BadRequest"),
            Self::NotFound(_) => (404, "NotFound"),
            Self::Busy { .. } => (503, "ServiceUnavailable"),
            Self::Store(_) => (500, "InternalServerError"),
        }
    }
}
