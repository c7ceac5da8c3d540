//! Parallel tile-based software rasterizer.
//!
//! The pipeline accepts clip-space triangles (and fattened lines, points and
//! diagonalized quads) through a draw-context ring, bins them per macro tile
//! in a frontend pass, and rasterizes tiles with quad-rate pixel dispatch in
//! a backend pass. Draw order is preserved per pixel while tiles and
//! independent draws run in parallel across the worker pool.
//!
//! Shaders are plain function pointers over structure-of-arrays vertex
//! records; see [`shader`] for the contracts and `model::simd` for the lane
//! layout.

mod backend;
mod clip;
pub mod config;
mod context;
mod draw;
mod frontend;
mod rasterizer;
pub mod resource;
pub mod shader;
pub mod state;
pub mod stats;
mod threads;

#[cfg(test)]
mod tests;

pub use config::{ContextConfig, ThreadingMode};
pub use context::{Context, PipelineError};
pub use draw::{CompletionCallback, DrawIndex};
pub use model::{
    Bbox, ClearMask, CullMode, DriverType, IndexType, PrimitiveTopology, SurfaceFormat,
};
pub use resource::{BufferHandle, LockMode, RenderTargetHandle, ResourceError, TextureHandle};
pub use state::Viewport;
