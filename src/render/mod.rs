//! Render Update Coordinator
//!
//! Plot stages hand their layer content to a [`LayerSink`]; the
//! [`RenderCoordinator`] implementation serializes, coalesces and rate-limits
//! those updates and keeps all layers aligned in one coordinate space.
//!
//! ## Threads
//!
//! - Producers: any pipeline worker, via [`RenderCoordinator::submit`]
//! - `treevis-render`: the single consumer draining the [`UpdateQueue`]
//! - `treevis-present`: the serial presentation context owning the surface

pub mod coordinator;
pub mod geometry;
pub mod image_cache;
pub mod layer;
pub mod presenter;
pub mod queue;

pub use coordinator::{LayerSink, RenderCoordinator, RenderEvent};
pub use geometry::{Point, Rect, Transform};
pub use image_cache::{DecodedImage, ImageCache, ImageFormat};
pub use layer::{LayerContent, Primitive, Primitives, RenderLayer};
pub use presenter::{HeadlessState, HeadlessSurface, PassSummary, PresentationSurface, PresentationThread};
pub use queue::{coalesce, LayerUpdate, UpdateQueue, UpdateRequest};
