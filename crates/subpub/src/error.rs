use thiserror::Error;

/// Errors returned by the bus.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The bus has been closed (or is closing).
    #[error("subpub: bus is closed")]
    Closed,

    /// The cancellation token passed to close fired before all workers exited.
    #[error("subpub: close cancelled before workers finished")]
    Cancelled,

    /// The timeout passed to close elapsed before all workers exited.
    #[error("subpub: close deadline exceeded before workers finished")]
    DeadlineExceeded,
}
