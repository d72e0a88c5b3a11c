use thiserror::Error;

/// The only errors visible to callers. Structured-parse failures are never
/// surfaced; they degrade into the next strategy until the waterfall is
/// exhausted.
#[derive(Debug, Error)]
pub enum CountError {
    #[error("failed to read input")]
    Io(#[from] std::io::Error),
    #[error("page count not found")]
    PageCountNotFound,
}
