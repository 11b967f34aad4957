use thiserror::Error;

/// The three-way verdict a dataplane call can return, per the core's contract
/// with its clients: a call either succeeds, is retriable, or tells us the
/// kernel categorically cannot do what we asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    NotSupported,
    Retriable,
}

/// An error surfaced by a dataplane client call (link/addr/rule/wireguard ops).
#[derive(Error, Debug)]
#[error("{message}")]
pub struct DataplaneError {
    pub class: ErrorClass,
    pub message: String,
}

impl DataplaneError {
    pub fn not_supported(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::NotSupported,
            message: message.into(),
        }
    }

    pub fn retriable(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Retriable,
            message: message.into(),
        }
    }

    pub fn is_not_supported(&self) -> bool {
        self.class == ErrorClass::NotSupported
    }
}

impl From<std::io::Error> for DataplaneError {
    fn from(e: std::io::Error) -> Self {
        // `ENOTSUP`/`EOPNOTSUPP` is the only case the kernel uses to say a
        // whole operation class (e.g. a wireguard link type) isn't available.
        match e.raw_os_error() {
            Some(libc::EOPNOTSUPP) | Some(libc::ENOTSUP) | Some(libc::EPROTONOSUPPORT) => {
                DataplaneError::not_supported(e.to_string())
            },
            _ => DataplaneError::retriable(e.to_string()),
        }
    }
}

/// Top-level error returned by [`crate::Reconciler::apply`].
///
/// `Unsupported` is deliberately absent: per spec, entering UNSUPPORTED mode
/// is a successful outcome (a zero-key status publication), never an error.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("dataplane error: {0}")]
    Dataplane(#[from] DataplaneError),

    #[error("route reconciler error: {0}")]
    RouteTable(String),

    #[error("status callback error: {0}")]
    Status(String),
}
