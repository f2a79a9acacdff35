use std::error::Error;
use std::fmt;
use std::io;
use std::sync::Arc;

use http::StatusCode;
use parking_lot::Mutex;
use thiserror::Error;

/// Boxed error accepted from application code.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Every way an exchange can go wrong.
///
/// The variants follow the failure taxonomy of the engine: what the transport reports, what the
/// request header violates, what the application raises, and the contract violations the engine
/// detects itself.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transport error: {source}")]
    Transport {
        #[from]
        source: io::Error,
    },

    #[error("bad request ({status}): {reason}")]
    Protocol { status: StatusCode, reason: String },

    #[error("application error: {source}")]
    Application { source: BoxError },

    #[error("content-length {declared} != {written} written")]
    LengthMismatch { declared: u64, written: u64 },

    #[error("illegal state: {reason}")]
    StateViolation { reason: &'static str },

    #[error("illegal argument: {reason}")]
    InvalidArgument { reason: &'static str },

    #[error("unconsumed request body: {reason}")]
    UnconsumedBody { reason: String },
}

impl ExchangeError {
    pub fn protocol<S: ToString>(status: StatusCode, reason: S) -> Self {
        Self::Protocol { status, reason: reason.to_string() }
    }

    pub fn bad_request<S: ToString>(reason: S) -> Self {
        Self::protocol(StatusCode::BAD_REQUEST, reason)
    }

    pub fn application<E: Into<BoxError>>(e: E) -> Self {
        Self::Application { source: e.into() }
    }

    pub fn length_mismatch(declared: u64, written: u64) -> Self {
        Self::LengthMismatch { declared, written }
    }

    pub fn state_violation(reason: &'static str) -> Self {
        Self::StateViolation { reason }
    }

    pub fn invalid_argument(reason: &'static str) -> Self {
        Self::InvalidArgument { reason }
    }

    pub fn unconsumed_body<S: ToString>(reason: S) -> Self {
        Self::UnconsumedBody { reason: reason.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Transport { source: e.into() }
    }

    /// The status an error response for this error should carry.
    pub fn status(&self) -> StatusCode {
        match self {
            ExchangeError::Protocol { status, .. } => *status,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_state_violation(&self) -> bool {
        matches!(self, ExchangeError::StateViolation { .. })
    }

    pub fn is_length_mismatch(&self) -> bool {
        matches!(self, ExchangeError::LengthMismatch { .. })
    }

    pub fn is_unconsumed_body(&self) -> bool {
        matches!(self, ExchangeError::UnconsumedBody { .. })
    }
}

/// A shared, cheaply clonable failure cause.
///
/// The first failure stored on an exchange is handed to every pending callback, listener and
/// the completion path, so it is reference counted. Later failures are attached to it as
/// suppressed causes. Two `Failure`s are the *same* cause only when they share the allocation,
/// see [`Failure::is_same`].
#[derive(Clone)]
pub struct Failure {
    inner: Arc<FailureInner>,
}

struct FailureInner {
    error: ExchangeError,
    suppressed: Mutex<Vec<Failure>>,
}

impl Failure {
    pub fn new(error: ExchangeError) -> Self {
        Self { inner: Arc::new(FailureInner { error, suppressed: Mutex::new(Vec::new()) }) }
    }

    pub fn error(&self) -> &ExchangeError {
        &self.inner.error
    }

    pub fn status(&self) -> StatusCode {
        self.inner.error.status()
    }

    /// Pointer identity: true when both handles refer to the same recorded cause.
    pub fn is_same(&self, other: &Failure) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Records `other` as suppressed by this failure.
    ///
    /// Adding a failure to itself, or adding one that is already recorded, is a no-op.
    pub fn add_suppressed(&self, other: Failure) {
        if self.is_same(&other) {
            return;
        }
        let mut suppressed = self.inner.suppressed.lock();
        if suppressed.iter().any(|f| f.is_same(&other)) {
            return;
        }
        suppressed.push(other);
    }

    pub fn suppressed(&self) -> Vec<Failure> {
        self.inner.suppressed.lock().clone()
    }
}

impl From<ExchangeError> for Failure {
    fn from(error: ExchangeError) -> Self {
        Failure::new(error)
    }
}

impl From<io::Error> for Failure {
    fn from(e: io::Error) -> Self {
        Failure::new(ExchangeError::io(e))
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Failure")
            .field("error", &self.inner.error)
            .field("suppressed", &self.inner.suppressed.lock().len())
            .finish()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner.error, f)?;
        let suppressed = self.inner.suppressed.lock().len();
        if suppressed > 0 {
            write!(f, " (+{suppressed} suppressed)")?;
        }
        Ok(())
    }
}

impl Error for Failure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.inner.error)
    }
}
