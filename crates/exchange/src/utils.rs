//! Utility macros used across the exchange engine.

/// Returns early with an error if a condition is not met.
///
/// Works like `assert!`, but hands the error back to the caller instead of panicking.
/// Most state checks in the channel are written with it.
///
/// # Example
///
/// ```ignore
/// ensure!(state.exchange.is_none(), ExchangeError::state_violation("exchange already active"));
/// ```
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

pub(crate) use ensure;
