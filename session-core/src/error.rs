//! Error kinds shared across the session subsystem (`spec.md` §7).

pub type Result<T> = std::result::Result<T, Error>;

/// The six error kinds the session subsystem distinguishes.
///
/// Storage adapters convert their native errors into one of these; the
/// cache and manager layers react differently depending on which kind they
/// see (e.g. `Unreadable` triggers cross-context invalidation, `Transient`
/// is logged and retried on the next operation).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The id is absent from the store. Mapped to "no such session" at the
    /// manager surface.
    #[error("session not found")]
    NotFound,

    /// The store returned data that could not be deserialized into a
    /// `SessionData`. Distinct from `NotFound` — the row exists but is
    /// unreadable, which is treated as a correctness hazard rather than a
    /// miss.
    #[error("session record unreadable: {0}")]
    Unreadable(String),

    /// A compare-and-set on the cache's identity table lost the race;
    /// callers should use the winner's object instead of retrying the
    /// insert.
    #[error("lost the race to cache a session")]
    Conflict,

    /// A retryable I/O failure. The dirty flag on the affected session is
    /// left set so a later write can retry.
    #[error("transient storage error: {0}")]
    Transient(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// An operation was attempted before start or after stop.
    #[error("operation attempted outside the component's running lifecycle")]
    Lifecycle,

    /// A fatal misconfiguration, e.g. a worker name containing `.`, or no
    /// data source configured. Raised at start, never swallowed.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Wrap an arbitrary transport/backend error as [`Error::Transient`].
    pub fn transient(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Transient(Box::new(err))
    }
}
