//! # hatcast-core
//!
//! Real-time face detection, accessory overlay and UDP frame distribution.
//!
//! Per captured frame:
//!
//! 1. a coarse [`detection::RegionDetector`] proposes face candidates,
//! 2. each candidate is verified by a local-binary-pattern descriptor
//!    ([`features`]) fed to a linear [`classifier`],
//! 3. the active accessory from the [`catalog`] is composited onto every
//!    verified face ([`overlay`]),
//! 4. the frame is JPEG-encoded, fragmented ([`protocol`]) and fanned out to
//!    every registered UDP client ([`server`]).
//!
//! A control listener runs next to the streaming loop and mutates the client
//! set and the accessory selection from inbound datagrams.

pub mod catalog;
pub mod classifier;
pub mod detection;
pub mod features;
pub mod overlay;
pub mod pipeline;
pub mod protocol;
pub mod runtime;
pub mod server;
pub mod video;

// Re-export the top-level error type so callers only need `hatcast_core::Error`
pub use anyhow::Error;
pub use anyhow::Result;
