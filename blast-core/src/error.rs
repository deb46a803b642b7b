use thiserror::Error;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error(transparent)]
    Diesel(#[from] diesel::result::Error),

    #[error("connection pool: {0}")]
    Pool(String),

    #[error("unknown {kind} value in store: {value:?}")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("corrupt row {table}#{id}: {reason}")]
    CorruptRow {
        table: &'static str,
        id: i64,
        reason: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl StoreError {
    pub fn unknown_variant(kind: &'static str, value: impl Into<String>) -> Self {
        Self::UnknownVariant {
            kind,
            value: value.into(),
        }
    }

    pub fn corrupt(table: &'static str, id: i64, reason: impl Into<String>) -> Self {
        Self::CorruptRow {
            table,
            id,
            reason: reason.into(),
        }
    }
}
