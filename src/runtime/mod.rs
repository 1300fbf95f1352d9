//! Single-writer async runtime, sessions, and event stream APIs.

/// Event stream types emitted by the runtime.
pub mod events;
/// Handle, session, and command loop implementation.
pub mod handle;
