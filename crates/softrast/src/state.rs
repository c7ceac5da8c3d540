//! Resolved per-draw state. The API thread mutates the pending draw's state
//! through the setters on `Context`; `queue_draw` snapshots it into the draw
//! context, after which workers treat it as immutable.

use std::sync::Arc;

use model::{
    Bbox, CullMode, DriverType, FIXED_POINT_ONE, GUARDBAND_HEIGHT, GUARDBAND_WIDTH, IndexType,
    PrimitiveTopology, TILE_DIM_SHIFT,
};
use render_target::TileBuffer;

use crate::resource::BufferAlloc;
use crate::shader::{
    FetchFn, MAX_SAMPLERS, MAX_TEXTURE_VIEWS, MAX_VERTEX_STREAMS, NUM_ATTACHMENTS, PixelFn,
    ShaderResourceHandle, VertexFn,
};
use crate::stats::PipelineCounters;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_z: f32,
    pub max_z: f32,
}

impl Default for Viewport {
    fn default() -> Self {
        Viewport {
            x: 0.0,
            y: 0.0,
            width: 0.0,
            height: 0.0,
            min_z: 0.0,
            max_z: 1.0,
        }
    }
}

impl Viewport {
    pub fn half_width(&self) -> f32 {
        self.width * 0.5
    }

    pub fn half_height(&self) -> f32 {
        self.height * 0.5
    }
}

/// Guardband plane multipliers: a vertex is inside when
/// `-left*w <= x <= right*w` and `-top*w <= y <= bottom*w`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Guardband {
    pub left: f32,
    pub right: f32,
    pub top: f32,
    pub bottom: f32,
}

impl Default for Guardband {
    fn default() -> Self {
        Guardband {
            left: 1.0,
            right: 1.0,
            top: 1.0,
            bottom: 1.0,
        }
    }
}

impl Guardband {
    /// Guardband center is the viewport center; the multipliers scale with
    /// the viewport dimensions.
    pub fn for_viewport(viewport: &Viewport) -> Guardband {
        if viewport.width <= 0.0 || viewport.height <= 0.0 {
            return Guardband::default();
        }
        Guardband {
            left: GUARDBAND_WIDTH / viewport.width,
            right: GUARDBAND_WIDTH / viewport.width,
            top: GUARDBAND_HEIGHT / viewport.height,
            bottom: GUARDBAND_HEIGHT / viewport.height,
        }
    }
}

/// Snapshot of everything a draw needs. Cloned from the previous draw when a
/// ring slot is acquired, then adjusted by state setters until submit.
#[derive(Clone)]
pub struct DrawState {
    pub driver: DriverType,
    pub topology: PrimitiveTopology,
    pub index_type: IndexType,

    pub fetch_fn: FetchFn,
    pub vertex_fn: VertexFn,
    pub pixel_fn: PixelFn,

    pub cull_mode: CullMode,
    pub viewport: Viewport,
    pub guardband: Guardband,
    /// Client scissor rectangle, right/bottom exclusive.
    pub scissor_rect: Bbox,
    pub scissor_enable: bool,

    /// Attribute linkage: which vertex-output slots feed the pixel stage,
    /// selected by facing.
    pub linkage_mask_front: u32,
    pub linkage_mask_back: u32,

    pub vertex_buffers: [Option<Arc<BufferAlloc>>; MAX_VERTEX_STREAMS],
    pub index_buffer: Option<Arc<BufferAlloc>>,
    pub fetch_constants: Option<Arc<BufferAlloc>>,
    pub vertex_constants: Option<Arc<BufferAlloc>>,
    pub pixel_constants: Option<Arc<BufferAlloc>>,

    pub render_targets: [Option<Arc<TileBuffer>>; NUM_ATTACHMENTS],
    pub texture_views: [ShaderResourceHandle; MAX_TEXTURE_VIEWS],
    pub samplers: [ShaderResourceHandle; MAX_SAMPLERS],

    /// Shared debug counters of the owning context.
    pub counters: Arc<PipelineCounters>,

    // Derived at submit by `setup_scissor`.
    /// Inclusive scissor in pixels.
    pub scissor_in_pixels: Bbox,
    /// Inclusive scissor in 24.8 fixed point (pixel centers).
    pub scissor_in_fixed: Bbox,
    /// Inclusive scissor in pixel tiles.
    pub scissor_in_tiles: Bbox,
    /// Macro tile extent in pixel tiles.
    pub macro_width_in_tiles: u32,
    pub macro_height_in_tiles: u32,
}

impl DrawState {
    pub fn new(driver: DriverType) -> Self {
        DrawState {
            driver,
            topology: PrimitiveTopology::TriangleList,
            index_type: IndexType::U32,
            fetch_fn: crate::shader::unbound_fetch,
            vertex_fn: crate::shader::unbound_vertex,
            pixel_fn: crate::shader::unbound_pixel,
            cull_mode: CullMode::None,
            viewport: Viewport::default(),
            guardband: Guardband::default(),
            scissor_rect: Bbox::default(),
            scissor_enable: false,
            linkage_mask_front: 0,
            linkage_mask_back: 0,
            vertex_buffers: [const { None }; MAX_VERTEX_STREAMS],
            index_buffer: None,
            fetch_constants: None,
            vertex_constants: None,
            pixel_constants: None,
            render_targets: [const { None }; NUM_ATTACHMENTS],
            texture_views: [0; MAX_TEXTURE_VIEWS],
            samplers: [0; MAX_SAMPLERS],
            counters: Arc::new(PipelineCounters::default()),
            scissor_in_pixels: Bbox::default(),
            scissor_in_fixed: Bbox::default(),
            scissor_in_tiles: Bbox::default(),
            macro_width_in_tiles: 1,
            macro_height_in_tiles: 1,
        }
    }

    /// Derive the scissor rectangles used by binning and rasterization from
    /// either the client scissor or the viewport, and record the macro-tile
    /// extent chosen for this draw.
    pub fn setup_scissor(&mut self, macro_width: u32, macro_height: u32) {
        let (left, top, right, bottom) = if self.scissor_enable {
            // The client rect is right/bottom exclusive; the core works with
            // inclusive bounds.
            (
                self.scissor_rect.left,
                self.scissor_rect.top,
                self.scissor_rect.right - 1,
                self.scissor_rect.bottom - 1,
            )
        } else {
            (
                self.viewport.x as i32,
                self.viewport.y as i32,
                self.viewport.x as i32 + self.viewport.width as i32 - 1,
                self.viewport.y as i32 + self.viewport.height as i32 - 1,
            )
        };

        self.scissor_in_pixels = Bbox::new(left, top, right, bottom);
        self.scissor_in_fixed = Bbox::new(
            left * FIXED_POINT_ONE + FIXED_POINT_ONE / 2,
            top * FIXED_POINT_ONE + FIXED_POINT_ONE / 2,
            right * FIXED_POINT_ONE + FIXED_POINT_ONE / 2,
            bottom * FIXED_POINT_ONE + FIXED_POINT_ONE / 2,
        );
        self.scissor_in_tiles = Bbox::new(
            left >> TILE_DIM_SHIFT,
            top >> TILE_DIM_SHIFT,
            right >> TILE_DIM_SHIFT,
            bottom >> TILE_DIM_SHIFT,
        );
        self.macro_width_in_tiles = macro_width >> TILE_DIM_SHIFT;
        self.macro_height_in_tiles = macro_height >> TILE_DIM_SHIFT;
    }

    /// Union of both facings' linkage masks: the slots the frontend must
    /// carry through the post-transform buffer.
    pub fn linkage_union(&self) -> u32 {
        self.linkage_mask_front | self.linkage_mask_back
    }

    pub fn linkage_for_facing(&self, back_facing: bool) -> u32 {
        if back_facing {
            self.linkage_mask_back
        } else {
            self.linkage_mask_front
        }
    }

    /// Does the scissor cut through tiles inside `tile_bbox`? When true the
    /// rasterizer folds the scissor edges into partial-tile coverage.
    pub fn scissor_cuts_tiles(&self, tile_bbox: &Bbox) -> bool {
        let pixels = Bbox::new(
            tile_bbox.left << TILE_DIM_SHIFT,
            tile_bbox.top << TILE_DIM_SHIFT,
            ((tile_bbox.right + 1) << TILE_DIM_SHIFT) - 1,
            ((tile_bbox.bottom + 1) << TILE_DIM_SHIFT) - 1,
        );
        !(self.scissor_in_pixels.left <= pixels.left
            && self.scissor_in_pixels.top <= pixels.top
            && self.scissor_in_pixels.right >= pixels.right
            && self.scissor_in_pixels.bottom >= pixels.bottom)
    }
}
