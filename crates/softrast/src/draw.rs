//! Draw contexts and the work items that flow through them. A draw context
//! is the self-contained record of one submitted draw chunk: state snapshot,
//! one frontend work item, a macro-tile manager of backend work and a bump
//! arena for per-triangle buffers.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use arena::DrawArena;
use model::{Bbox, ClearMask, DriverType, SurfaceFormat};
use tile_fifo::MacroTileManager;

use crate::state::DrawState;

/// Zero-based submission index of a draw. Strictly increasing; doubles as
/// the ring position (`index % MAX_DRAWS_IN_FLIGHT`).
pub type DrawIndex = u64;

/// Per-triangle flags carried from the binner into the backend work item.
#[derive(Debug, Clone, Copy, Default)]
pub struct TriFlags {
    pub back_facing: bool,
    pub macro_x: u16,
    pub macro_y: u16,
    /// Prebaked coverage for one-tile triangles; unused otherwise.
    pub coverage_mask: u64,
}

/// Backend triangle work. The pointers reference the owning draw's arena,
/// which stays valid until the draw retires and its slot is reused.
#[derive(Debug, Clone, Copy)]
pub struct TriangleWorkDesc {
    /// 16 floats: x[3]+pad, y[3]+pad, z[3]+pad, 1/w[3]+pad.
    pub tri_buffer: *const f32,
    /// 12 floats per linked attribute; see `TriangleDesc::attribute`.
    pub interp_buffer: *const f32,
    pub flags: TriFlags,
}

#[derive(Debug, Clone, Copy)]
pub struct ClearDesc {
    pub mask: ClearMask,
    /// Packed BGRA8 clear color.
    pub color: u32,
    /// Bit pattern of the f32 depth clear value.
    pub depth_bits: u32,
    /// Inclusive pixel rectangle to clear.
    pub rect: Bbox,
}

#[derive(Debug, Clone, Copy)]
pub struct StoreDesc {
    /// Linear destination; rows are `pitch` bytes apart.
    pub dst: *mut u8,
    pub pitch: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct CopyDesc {
    pub dst: *mut u8,
    pub dst_pitch: usize,
    /// Attachment index to read from.
    pub attachment: usize,
    /// Inclusive source rectangle in render-target pixels.
    pub src: Bbox,
    pub dst_x: i32,
    pub dst_y: i32,
    pub dst_format: SurfaceFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum BeWorkDesc {
    Triangle(TriangleWorkDesc),
    Clear(ClearDesc),
    Store(StoreDesc),
    Copy(CopyDesc),
}

pub type BeWorkFn = fn(&DrawContext, u32, &BeWorkDesc);

/// One backend work item, dispatched per macro tile.
#[derive(Clone, Copy)]
pub struct BeWork {
    pub func: BeWorkFn,
    pub desc: BeWorkDesc,
}

// Raw pointers in the descriptors reference the draw arena, client pixel
// memory (kept alive by the submitting call until retirement) or texture
// storage (kept alive by its Arc in the draw state).
unsafe impl Send for BeWork {}

#[derive(Debug, Clone, Copy)]
pub enum VertexSource {
    Direct,
    Indexed { index_offset: u32 },
}

#[derive(Debug, Clone, Copy)]
pub struct FeDrawDesc {
    pub start_vertex: u32,
    /// First primitive of this chunk within the original draw call.
    pub start_prim: u32,
    pub prim_count: u32,
    pub instance: u32,
    pub source: VertexSource,
}

#[derive(Debug, Clone, Copy)]
pub enum FeWorkDesc {
    Draw(FeDrawDesc),
    Clear(ClearDesc),
    Store(StoreDesc),
    Copy(CopyDesc),
}

pub type FeWorkFn = fn(&DrawContext, &FeWorkDesc);

#[derive(Clone, Copy)]
pub struct FeWork {
    pub func: FeWorkFn,
    pub desc: FeWorkDesc,
}

unsafe impl Send for FeWork {}

pub type CompletionCallback = Box<dyn FnOnce(&DrawContext) + Send>;

/// The parts of a draw context that only one thread touches at a time: the
/// API thread while the slot is free, the claiming FE worker afterwards.
pub struct Payload {
    pub state: DrawState,
    pub fe_work: Option<FeWork>,
    pub on_complete: Option<CompletionCallback>,
}

/// One slot of the draw-context ring.
pub struct DrawContext {
    /// Submission index; written by the API thread while the slot is free.
    pub draw_index: AtomicU64,
    pub in_use: AtomicBool,
    pub done_fe: AtomicBool,
    /// Frontend claim word. CAS 0 -> 1 claims the frontend; it is never
    /// released and stays 1 as a "claimed" sentinel until slot reuse.
    pub fe_lock: AtomicU32,
    /// Predecessor draw this one must wait for: `index + 1`, 0 for none.
    pub dependency: AtomicU64,
    /// Wait for the predecessor's full retirement instead of FE completion.
    pub dep_complete_draw: AtomicBool,
    pub tile_mgr: MacroTileManager<BeWork>,
    pub arena: DrawArena,
    payload: UnsafeCell<Payload>,
}

// Payload access follows the ring protocol: the API thread mutates it only
// while `still_drawing` is false and before the enqueue counter publishes the
// slot; workers read it (and the FE owner appends to the arena) afterwards.
unsafe impl Sync for DrawContext {}

impl DrawContext {
    pub fn new(driver: DriverType) -> Self {
        DrawContext {
            draw_index: AtomicU64::new(0),
            in_use: AtomicBool::new(false),
            done_fe: AtomicBool::new(false),
            fe_lock: AtomicU32::new(0),
            dependency: AtomicU64::new(0),
            dep_complete_draw: AtomicBool::new(false),
            tile_mgr: MacroTileManager::new(),
            arena: DrawArena::new(),
            payload: UnsafeCell::new(Payload {
                state: DrawState::new(driver),
                fe_work: None,
                on_complete: None,
            }),
        }
    }

    /// Shared read of the state snapshot. Valid from enqueue to retirement.
    pub fn state(&self) -> &DrawState {
        unsafe { &(*self.payload.get()).state }
    }

    pub fn fe_work(&self) -> FeWork {
        unsafe { (*self.payload.get()).fe_work.expect("draw enqueued without FE work") }
    }

    /// Exclusive payload access for the API thread while the slot is free.
    ///
    /// # Safety
    /// Caller must be the API thread and `still_drawing` must be false (or
    /// the slot not yet published).
    pub unsafe fn payload_mut(&self) -> &mut Payload {
        unsafe { &mut *self.payload.get() }
    }

    /// Detach the completion callback. Called exactly once, by the worker
    /// that drained the draw's final tile; exclusivity comes from
    /// `mark_tile_complete` returning true to exactly one caller.
    pub fn take_on_complete(&self) -> Option<CompletionCallback> {
        unsafe { (*self.payload.get()).on_complete.take() }
    }

    pub fn dependency(&self) -> Option<DrawIndex> {
        match self.dependency.load(Ordering::Acquire) {
            0 => None,
            raised => Some(raised - 1),
        }
    }

    pub fn set_dependency(&self, dep: Option<DrawIndex>) {
        self.dependency
            .store(dep.map_or(0, |index| index + 1), Ordering::Release);
    }

    /// Is this slot's draw still anywhere in the pipeline? A slot is free
    /// when it was never enqueued or when its frontend finished and every
    /// binned work item has been consumed.
    pub fn still_drawing(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
            && !(self.done_fe.load(Ordering::Acquire) && self.tile_mgr.is_work_complete())
    }
}
