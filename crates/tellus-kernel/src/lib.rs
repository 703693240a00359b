//! # Tellus Kernel
//!
//! GPU dual-contouring mesh extraction and chunk streaming for an infinite
//! voxel terrain.
//!
//! This crate provides the core terrain machinery:
//! - Per-chunk density volumes resident on the GPU, generated by an opaque
//!   [`volume::VolumeGenerator`] collaborator
//! - A multi-pass dual-contouring compute pipeline with LOD-aware vertex
//!   merging and watertight chunk boundaries
//! - A non-blocking, speculatively sized GPU→host readback protocol
//! - A bounded worker pool serving mesh requests FIFO
//! - A BFS streaming scheduler that admits and evicts chunks around a
//!   moving viewer and assigns LOD bands by distance
//!
//! ## Architecture
//!
//! Everything runs on a single cooperative tick thread; GPU work executes
//! asynchronously on its own timeline and is only ever polled, never waited
//! on (the sole exception is draining a readback before buffer
//! destruction). A typical frame:
//!
//! ```ignore
//! streamer.tick(&device, &queue, &mut dispatcher, &generator, viewer);
//! dispatcher.tick(&device, &queue);
//! ```
//!
//! Components are constructed once at startup and passed explicitly; the
//! [`config::SharedConfig`] version counter replaces change notifications,
//! and each component reacts to a new version at the start of its own tick.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod chunk;
pub mod chunk_io;
pub mod config;
pub mod dispatch;
pub mod pipeline;
pub mod readback;
pub mod streaming;
pub mod validation;
pub mod vertex;
pub mod volume;
pub mod worker;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::chunk::*;
    pub use crate::chunk_io::*;
    pub use crate::config::*;
    pub use crate::dispatch::*;
    pub use crate::pipeline::*;
    pub use crate::readback::*;
    pub use crate::streaming::*;
    pub use crate::validation::*;
    pub use crate::vertex::*;
    pub use crate::volume::*;
    pub use crate::worker::*;
}

pub use prelude::*;
