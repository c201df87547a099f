//! Jump-flooding Voronoi tessellation with Lloyd relaxation.
//!
//! Sites live in a [`SiteStore`] that tracks which entries still need to be
//! pushed to device memory. [`JfaEngine`] floods site ids across a
//! fixed-resolution grid with ping-pong buffers, and [`ReductionEngine`]
//! folds the resulting [`AssignmentGrid`] into per-site centroid sums to
//! produce one Lloyd step. Both engines run their passes through a
//! [`Dispatch`] implementation; [`CpuDispatch`] uses Rayon when the
//! `parallel` feature is enabled.

mod dispatch;
mod growable;
mod jfa;
mod reduction;
mod render;
mod site;

#[cfg(feature = "gpu")]
mod gpu;

pub use dispatch::{CpuDispatch, Dispatch, GridShape};
pub use growable::{DeviceAllocator, GrowableBuffer, HostAllocator, RecordBuffer, RecordHandle};
pub use jfa::{step_count, step_schedule, AssignmentGrid, Claim, JfaConfig, JfaEngine, PingPong, NO_SITE};
pub use reduction::{Accum, ReductionConfig, ReductionEngine, Relaxation};
pub use render::{render, RenderStyle};
pub use site::{Color, DirtyRange, Position, Site, SiteId, SiteMirror, SiteRecord, SiteStore};

#[cfg(feature = "gpu")]
pub use gpu::{GpuAllocator, GpuContext, GpuJfa};

/// Error type for tessellation and relaxation operations
#[derive(Debug, thiserror::Error)]
pub enum JfaError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid grid dimensions {width}x{height}")]
    InvalidGrid { width: i64, height: i64 },

    #[error("Allocation of {requested} bytes failed")]
    ResourceExhaustion { requested: u64 },

    #[error("Records must be released in LIFO order: expected offset {expected}, got {got}")]
    OutOfOrderRelease { expected: u64, got: u64 },

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[cfg(feature = "gpu")]
    #[error("GPU error: {0}")]
    Gpu(String),
}

pub type Result<T> = std::result::Result<T, JfaError>;
