/// Error taxonomy shared by every fallible operation in this crate.
///
/// The variants deliberately mirror how untrusted binary data can fail on
/// us: `Invalid` means the bytes themselves are malformed or out of range,
/// `NotFound` means a structure is simply absent (an expected outcome, not
/// a corruption signal), `NotSupported` means we recognized a format
/// variant we do not implement, and `Internal` means the platform refused
/// an operation for reasons unrelated to input validity.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("malformed or out-of-range binary data: {0}")]
    Invalid(&'static str),

    #[error("required structure is not present: {0}")]
    NotFound(&'static str),

    #[error("recognized but unsupported format variant: {0}")]
    NotSupported(&'static str),

    #[error("mapping or platform operation failed: {0}")]
    Internal(&'static str),
}

impl Error {
    /// True for the "structure is absent" case, which callers commonly
    /// treat as a fallback trigger rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

/// The result type used throughout this crate.
pub type Result<T> = core::result::Result<T, Error>;
