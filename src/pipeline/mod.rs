//! Stages of one reverse-prompt run.
//!
//! Each submodule owns one step and one seam. Only [`transport`] and
//! [`upload`] touch the network, and each sits behind a trait so the
//! orchestration in [`crate::process`] can be driven by in-process doubles.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ upload ──▶ analyze ──▶ generate ──▶ poller
//! (path/URL) (multipart) (JSON POST) (JSON POST)  (queue_status → result)
//! ```
//!
//! 1. [`input`]: resolve a path or URL to validated image bytes
//! 2. [`upload`]: stream the bytes as multipart, reporting percent sent
//! 3. [`transport`]: one JSON request per call, used by analyze, generate
//!    and polling
//! 4. [`poller`]: tick `/queue_status/{id}` until terminal; owns the
//!    cancellation tracker

pub mod input;
pub mod poller;
pub mod transport;
pub mod upload;

#[cfg(test)]
pub(crate) mod testing;
