//! GPU-driven cluster culling and rasterization.
//!
//! A scheduling core for virtualized-geometry rendering: packed view sets are
//! culled per instance, then hierarchically per BVH node and cluster, binned
//! by material pipeline, and rasterized through a software (compute) path for
//! small clusters and a hardware (draw) path for large ones. Occlusion runs
//! in two passes against a hierarchical Z pyramid, with a silent downgrade to
//! unoccluded culling when no previous-frame pyramid exists. Missing geometry
//! detail is reported to an external streaming manager through a bounded
//! feedback buffer.
//!
//! [`cull_raster::cull_rasterize`] is the entry point; [`context`] holds the
//! shared, per-target and per-invocation state it operates on.

#![warn(missing_docs)]

pub mod binning;
pub mod config;
pub mod context;
pub mod cull_raster;
pub mod error;
pub mod filter;
pub mod gpu;
pub mod hierarchy_cull;
pub mod hzb;
pub mod instance_cull;
pub mod math;
pub mod pipelines;
pub mod queue;
pub mod rasterize;
pub mod scene;
pub mod stats;
pub mod streaming;
pub mod view;

pub use config::{CullConfig, DebugFlags, FrameInputs, Settings};
pub use context::{CullingContext, OutputMode, RasterContext, SharedContext};
pub use cull_raster::{cull_rasterize, plan_occlusion, CullRasterInputs, OcclusionPlan};
pub use error::{Error, Result};
pub use view::{PackedView, PackedViewArray, ViewParams, ViewRange};
