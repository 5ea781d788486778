//! Error domains of the daemon.
//!
//! Only two kinds ever propagate: start-up failures (abort with exit
//! code 1 before the loop runs) and display I/O failures (stop the loop,
//! clean up, exit 0). Everything else is logged where it happens and
//! swallowed so the loop keeps turning.

use x11rb::errors::{ConnectError, ConnectionError, ReplyError, ReplyOrIdError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Cannot open the display, claim the primary bus name, or install
    /// the signal matches. Terminal before the loop starts.
    #[error("{0}")]
    Startup(String),

    /// The display connection is gone. Terminal; the loop exits at the
    /// top of the next tick and cleanup runs on a best-effort basis.
    #[error("display connection lost: {0}")]
    Display(#[from] ConnectionError),

    /// Failure on the session bus connection itself.
    #[error("bus error: {0}")]
    Bus(#[from] zbus::Error),
}

impl From<ConnectError> for Error {
    fn from(err: ConnectError) -> Self {
        Error::Startup(format!("cannot open display: {err}"))
    }
}

impl From<ReplyError> for Error {
    fn from(err: ReplyError) -> Self {
        match err {
            ReplyError::ConnectionError(e) => Error::Display(e),
            // A request-level error reply is not a broken connection.
            ReplyError::X11Error(e) => Error::Startup(format!("display request failed: {e:?}")),
        }
    }
}

impl From<ReplyOrIdError> for Error {
    fn from(err: ReplyOrIdError) -> Self {
        match err {
            ReplyOrIdError::ConnectionError(e) => Error::Display(e),
            ReplyOrIdError::X11Error(e) => Error::Startup(format!("display request failed: {e:?}")),
            ReplyOrIdError::IdsExhausted => {
                Error::Startup("display resource ids exhausted".into())
            }
        }
    }
}

/// Registration refusals. Logged by the caller; the publisher still gets
/// an empty method reply either way.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CatalogueError {
    #[error("service is already registered")]
    AlreadyPresent,
    #[error("catalogue is full")]
    CapacityExceeded,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_error_maps_to_startup() {
        let err: Error = ConnectError::InvalidScreen.into();
        assert!(matches!(err, Error::Startup(_)));
    }

    #[test]
    fn catalogue_errors_are_distinct() {
        assert_ne!(CatalogueError::AlreadyPresent, CatalogueError::CapacityExceeded);
        assert_eq!(
            CatalogueError::CapacityExceeded.to_string(),
            "catalogue is full"
        );
    }
}
