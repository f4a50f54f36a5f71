use failure::{Error, Fail};

/// The failure categories surfaced by caches, the coalesce engine and the argument layer.
///
/// Public operations return `failure::Error`; use `downcast_ref::<CacheError>()` to
/// recover the category.
#[derive(Debug, Fail, PartialEq, Clone)]
pub enum CacheError {
    /// A parameter has the wrong type or shape, or a required field is missing.
    #[fail(display = "{}", _0)]
    InvalidArgument(String),
    /// A numeric value does not fit the width of the field it is destined for.
    #[fail(display = "{}", _0)]
    RangeError(String),
    /// Persisted data could not be read or written.
    #[fail(display = "{}", _0)]
    Io(String),
}

pub fn invalid_argument<S: Into<String>>(message: S) -> Error {
    CacheError::InvalidArgument(message.into()).into()
}

pub fn range_error<S: Into<String>>(message: S) -> Error {
    CacheError::RangeError(message.into()).into()
}

pub fn io_error<S: Into<String>>(message: S) -> Error {
    CacheError::Io(message.into()).into()
}

#[test]
fn downcast_test() {
    let err = range_error("id must be < 2^20");
    assert_eq!(
        err.downcast_ref::<CacheError>(),
        Some(&CacheError::RangeError("id must be < 2^20".to_owned())),
        "category survives conversion into failure::Error"
    );
    assert_eq!(err.to_string(), "id must be < 2^20");
}
