//! Helper macros for logging (console printing).
//!
//! Every macro takes a prefix expression (usually the replica or client ID)
//! that gets printed parenthesized in front of the message.

/// Log TRACE message with parenthesized prefix.
///
/// Example:
/// ```no_run
/// use paxkv::pf_trace;
/// let id = 0;
/// let msg = "hello";
/// pf_trace!(id; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($prefix:expr; $($arg:tt)*) => {
        log::trace!("({}) {}", $prefix, format!($($arg)*))
    };
}

/// Log DEBUG message with parenthesized prefix.
#[macro_export]
macro_rules! pf_debug {
    ($prefix:expr; $($arg:tt)*) => {
        log::debug!("({}) {}", $prefix, format!($($arg)*))
    };
}

/// Log INFO message with parenthesized prefix.
#[macro_export]
macro_rules! pf_info {
    ($prefix:expr; $($arg:tt)*) => {
        log::info!("({}) {}", $prefix, format!($($arg)*))
    };
}

/// Log WARN message with parenthesized prefix.
#[macro_export]
macro_rules! pf_warn {
    ($prefix:expr; $($arg:tt)*) => {
        log::warn!("({}) {}", $prefix, format!($($arg)*))
    };
}

/// Log ERROR message with parenthesized prefix.
#[macro_export]
macro_rules! pf_error {
    ($prefix:expr; $($arg:tt)*) => {
        log::error!("({}) {}", $prefix, format!($($arg)*))
    };
}

/// Log an error string to logger and then return a `PaxkvError` containing
/// the prefixed string, wrapped in `Err()`.
///
/// Example:
/// ```no_run
/// use paxkv::{logged_err, pf_error, utils::PaxkvError};
/// fn example(id: u32, msg: &str) -> Result<(), PaxkvError> {
///     return logged_err!(id; "got {} to print", msg);
/// }
/// ```
#[macro_export]
macro_rules! logged_err {
    ($prefix:expr; $($arg:tt)*) => {{
        pf_error!($prefix; $($arg)*);
        Err($crate::utils::PaxkvError(format!(
            "({}) {}",
            $prefix,
            format!($($arg)*)
        )))
    }};
}

#[cfg(test)]
mod print_tests {
    use crate::utils::PaxkvError;

    #[test]
    fn error_no_args() {
        assert_eq!(
            logged_err!(0; "interesting message"),
            Err::<(), PaxkvError>(PaxkvError(
                "(0) interesting message".into()
            ))
        );
        assert_eq!(
            logged_err!("jose"; "interesting message"),
            Err::<(), PaxkvError>(PaxkvError(
                "(jose) interesting message".into()
            ))
        );
    }

    #[test]
    fn error_with_args() {
        assert_eq!(
            logged_err!(0; "got {} to print", 777),
            Err::<(), PaxkvError>(PaxkvError("(0) got 777 to print".into()))
        );
    }
}
