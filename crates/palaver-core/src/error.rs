use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Unknown conversation/message id in an inbound event. Reported to the
    /// originating connection only; never fatal.
    #[error("not found")]
    NotFound,
    /// Authorization violation: not a participant, or acting on someone
    /// else's message. No state is mutated.
    #[error("forbidden")]
    Forbidden,
    #[error("bad request: {0}")]
    BadRequest(String),
    /// A modeling invariant broke (e.g. admin succession found no
    /// candidate). Fatal for the operation, logged as an internal error.
    #[error("invariant violation: {0}")]
    Invariant(String),
    #[error("database error: {0}")]
    Database(#[from] palaver_db::DbError),
}
