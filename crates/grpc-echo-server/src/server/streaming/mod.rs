//! Response stream adapters used by the call pipeline.
//!
//! - [`DeadlineStream`] - ends a stream with `DEADLINE_EXCEEDED` at a fixed
//!   instant.
//! - [`LoggedStream`] - finishes a call's access-log record when the stream
//!   ends.
//! - [`ScopedStream`] - keeps a call's scope alive while the transport polls.

pub mod deadline;
pub mod logged;
pub mod scoped;

pub use deadline::DeadlineStream;
pub use logged::LoggedStream;
pub use scoped::ScopedStream;
