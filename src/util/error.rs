use std::error::Error;

/// Result type for callers that only need to report errors, not match on
/// them. Callback handlers return this.
pub type DynResult<T> = Result<T, Box<dyn Error + Send + Sync>>;
