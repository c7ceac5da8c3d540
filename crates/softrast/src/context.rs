//! The rendering context: draw-context ring, state setters, draw submission,
//! resource management and retirement tracking. One context is owned by one
//! API thread; workers share the ring through `Shared`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use model::{Bbox, ClearMask, CullMode, DriverType, IndexType, PrimitiveTopology, SurfaceFormat};
use render_target::TileBuffer;
use slotmap::SlotMap;

use crate::config::{ContextConfig, MAX_DRAWS_IN_FLIGHT, MAX_PRIMS_PER_DRAW, ThreadingMode};
use crate::draw::{
    ClearDesc, CompletionCallback, CopyDesc, DrawContext, DrawIndex, FeDrawDesc, FeWork,
    FeWorkDesc, StoreDesc, VertexSource,
};
use crate::resource::{
    Buffer, BufferAlloc, BufferHandle, LockMode, RenderTarget, RenderTargetHandle, ResourceError,
    Texture, TextureHandle,
};
use crate::shader::{
    ATTACHMENT_COLOR, ATTACHMENT_DEPTH, FetchFn, MAX_TEXTURE_VIEWS, MAX_VERTEX_STREAMS,
    NUM_ATTACHMENTS, PixelFn, ShaderResourceHandle, VertexFn,
};
use crate::state::{DrawState, Guardband, Viewport};
use crate::stats::{CounterSnapshot, PipelineCounters};
use crate::{frontend, threads};

/// Reasons a submission was dropped. Programming errors assert in debug
/// builds; release builds drop the work and latch the reason here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineError {
    EmptyDraw,
    MissingRenderTarget,
    MissingIndexBuffer,
    IndexRangeOutOfBounds,
    DestinationTooSmall,
    UnboundShader,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::EmptyDraw => write!(formatter, "draw submitted with zero primitives"),
            PipelineError::MissingRenderTarget => {
                write!(formatter, "operation requires a bound render target")
            }
            PipelineError::MissingIndexBuffer => {
                write!(formatter, "indexed draw without an index buffer")
            }
            PipelineError::IndexRangeOutOfBounds => {
                write!(formatter, "index range exceeds the bound index buffer")
            }
            PipelineError::DestinationTooSmall => {
                write!(formatter, "destination slice too small for the transfer")
            }
            PipelineError::UnboundShader => {
                write!(formatter, "draw submitted without all shader stages bound")
            }
        }
    }
}

impl std::error::Error for PipelineError {}

#[repr(align(64))]
pub(crate) struct PaddedCounter(pub AtomicU64);

/// State shared between the API thread and the workers.
pub(crate) struct Shared {
    pub ring: Box<[DrawContext]>,
    /// Count of draws published to workers. Single writer (API thread).
    pub draw_enqueued: AtomicU64,
    pub worker_fe: Box<[PaddedCounter]>,
    pub worker_be: Box<[PaddedCounter]>,
    pub wait_lock: Mutex<()>,
    pub fifos_not_empty: Condvar,
    pub shutdown: AtomicBool,
    pub num_numa_nodes: u32,
    pub counters: Arc<PipelineCounters>,
}

impl Shared {
    #[inline]
    pub fn dc(&self, index: DrawIndex) -> &DrawContext {
        &self.ring[(index % MAX_DRAWS_IN_FLIGHT as u64) as usize]
    }
}

/// Handles of the currently bound resources; resolved into the pending draw
/// state (and the dependency graph) at submit time.
#[derive(Default, Clone)]
struct Bindings {
    vertex_buffers: [Option<BufferHandle>; MAX_VERTEX_STREAMS],
    index_buffer: Option<BufferHandle>,
    fetch_constants: Option<BufferHandle>,
    vertex_constants: Option<BufferHandle>,
    pixel_constants: Option<BufferHandle>,
    render_targets: [Option<RenderTargetHandle>; NUM_ATTACHMENTS],
    textures: [Option<TextureHandle>; MAX_TEXTURE_VIEWS],
}

pub struct Context {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
    threading: ThreadingMode,
    driver: DriverType,

    /// Ring slot holding the pending (not yet submitted) draw, if any.
    current_slot: Option<usize>,
    /// Next draw index to assign.
    next_draw: DrawIndex,
    last_submitted: Option<DrawIndex>,
    /// Count of draws known retired; never decreases.
    retired: DrawIndex,

    bindings: Bindings,
    buffers: SlotMap<BufferHandle, Buffer>,
    textures: SlotMap<TextureHandle, Texture>,
    render_targets: SlotMap<RenderTargetHandle, RenderTarget>,

    last_error: Option<PipelineError>,

    // Inline-execution state for single-threaded mode.
    single_used_tiles: threads::UsedTiles,
    single_backoff: u32,
}

impl Context {
    pub fn new(config: ContextConfig) -> Context {
        let counters = Arc::new(PipelineCounters::default());
        let ring: Vec<DrawContext> = (0..MAX_DRAWS_IN_FLIGHT)
            .map(|_| {
                let dc = DrawContext::new(config.driver);
                // Every slot's state shares the context counters.
                unsafe { dc.payload_mut().state.counters = Arc::clone(&counters) };
                dc
            })
            .collect();

        let workers = match config.threading {
            ThreadingMode::Single => 1,
            ThreadingMode::Pool => crate::config::resolve_worker_count(&config),
        };
        let cursors = |n: usize| -> Box<[PaddedCounter]> {
            (0..n).map(|_| PaddedCounter(AtomicU64::new(0))).collect()
        };

        let shared = Arc::new(Shared {
            ring: ring.into_boxed_slice(),
            draw_enqueued: AtomicU64::new(0),
            worker_fe: cursors(workers),
            worker_be: cursors(workers),
            wait_lock: Mutex::new(()),
            fifos_not_empty: Condvar::new(),
            shutdown: AtomicBool::new(false),
            num_numa_nodes: threads::numa_node_count(),
            counters,
        });

        let worker_threads = match config.threading {
            ThreadingMode::Single => Vec::new(),
            ThreadingMode::Pool => threads::create_worker_pool(&shared, &config, workers),
        };
        tracing::info!(driver = ?config.driver, threading = ?config.threading, "context created");

        Context {
            shared,
            threads: worker_threads,
            threading: config.threading,
            driver: config.driver,
            current_slot: None,
            next_draw: 0,
            last_submitted: None,
            retired: 0,
            bindings: Bindings::default(),
            buffers: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            render_targets: SlotMap::with_key(),
            last_error: None,
            single_used_tiles: threads::UsedTiles::default(),
            single_backoff: 0,
        }
    }

    pub fn with_driver(driver: DriverType) -> Context {
        Context::new(ContextConfig {
            driver,
            ..ContextConfig::default()
        })
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.shared.counters.snapshot()
    }

    /// Most recent dropped-submission reason, cleared on read.
    pub fn take_last_error(&mut self) -> Option<PipelineError> {
        self.last_error.take()
    }

    /// Drop the pending submission before it was published. The acquired
    /// slot stays pending and is reused by the next submission.
    fn drop_submission(&mut self, error: PipelineError) -> PipelineError {
        debug_assert!(false, "submission dropped: {error}");
        PipelineCounters::bump(&self.shared.counters.draws_dropped, 1);
        tracing::error!(%error, "submission dropped");
        self.last_error = Some(error);
        error
    }

    // ---------------------------------------------------------------- ring

    fn wake_workers(&self) {
        if self.threads.is_empty() {
            return;
        }
        let _guard = self.shared.wait_lock.lock().expect("wait lock");
        self.shared.fifos_not_empty.notify_all();
    }

    fn update_last_retired(&mut self) {
        let enqueued = self.shared.draw_enqueued.load(Ordering::Acquire);
        while self.retired < enqueued {
            if self.shared.dc(self.retired).still_drawing() {
                break;
            }
            self.retired += 1;
        }
    }

    fn draw_retired(&mut self, index: DrawIndex) -> bool {
        self.update_last_retired();
        index < self.retired
    }

    /// Block until `index` retires, keeping workers awake meanwhile.
    fn wait_for_draw(&mut self, index: DrawIndex) {
        while !self.draw_retired(index) {
            self.wake_workers();
            std::hint::spin_loop();
        }
    }

    /// Wait for every submitted draw to retire.
    pub fn finish(&mut self) {
        if let Some(last) = self.last_submitted {
            self.wait_for_draw(last);
        }
    }

    /// Kick workers without waiting.
    pub fn flush(&mut self) {
        self.wake_workers();
    }

    /// Acquire (or return the already-pending) ring slot for the next draw.
    /// Spins with worker wake-ups while the slot's previous draw is still in
    /// flight.
    fn acquire_slot(&mut self) -> usize {
        if let Some(slot) = self.current_slot {
            return slot;
        }
        let index = self.next_draw;
        let slot = (index % MAX_DRAWS_IN_FLIGHT as u64) as usize;

        self.update_last_retired();
        while self.shared.ring[slot].still_drawing() {
            self.wake_workers();
            std::hint::spin_loop();
        }

        let shared = Arc::clone(&self.shared);
        let dc = &shared.ring[slot];
        dc.in_use.store(false, Ordering::Relaxed);
        dc.arena.reset();
        dc.done_fe.store(false, Ordering::Relaxed);
        dc.fe_lock.store(0, Ordering::Relaxed);
        dc.set_dependency(None);
        dc.dep_complete_draw.store(false, Ordering::Relaxed);
        dc.draw_index.store(index, Ordering::Relaxed);
        dc.tile_mgr.initialize();

        // The slot is quiescent: its previous draw retired and workers no
        // longer touch it, so the payload is ours to rewrite.
        unsafe {
            let payload = dc.payload_mut();
            if index > 0 {
                let prev_slot = ((index - 1) % MAX_DRAWS_IN_FLIGHT as u64) as usize;
                if prev_slot != slot {
                    payload.state = shared.ring[prev_slot].state().clone();
                }
            }
            payload.fe_work = None;
            payload.on_complete = None;
        }

        self.next_draw += 1;
        self.current_slot = Some(slot);
        slot
    }

    /// Mutable access to the pending draw's state.
    fn pending_state(&mut self) -> &mut DrawState {
        let slot = self.acquire_slot();
        unsafe { &mut self.shared.ring[slot].payload_mut().state }
    }

    /// Resolve bound handles into the pending state and record this draw in
    /// the resources' dependency history. `full_draw` distinguishes draws
    /// (which read buffers and textures) from clears/stores/copies (which
    /// only touch render targets).
    fn init_submission(&mut self, slot: usize, full_draw: bool) {
        let shared = Arc::clone(&self.shared);
        let dc = &shared.ring[slot];
        let index = dc.draw_index.load(Ordering::Relaxed);
        let mut dep: Option<DrawIndex> = None;

        let state = unsafe { &mut dc.payload_mut().state };

        for stream in 0..MAX_VERTEX_STREAMS {
            let handle = self.bindings.vertex_buffers[stream];
            state.vertex_buffers[stream] =
                handle.and_then(|h| self.buffers.get_mut(h)).map(|buffer| {
                    if full_draw {
                        buffer.deps.add_read(&mut dep, index);
                    }
                    Arc::clone(&buffer.current)
                });
        }
        state.index_buffer = self
            .bindings
            .index_buffer
            .and_then(|h| self.buffers.get_mut(h))
            .map(|buffer| {
                if full_draw {
                    buffer.deps.add_read(&mut dep, index);
                }
                Arc::clone(&buffer.current)
            });

        let constant_bindings = [
            self.bindings.fetch_constants,
            self.bindings.vertex_constants,
            self.bindings.pixel_constants,
        ];
        let mut resolved_constants: [Option<Arc<BufferAlloc>>; 3] = [const { None }; 3];
        for (binding, resolved) in constant_bindings.iter().zip(resolved_constants.iter_mut()) {
            *resolved = binding.and_then(|h| self.buffers.get_mut(h)).map(|buffer| {
                if full_draw {
                    buffer.deps.add_read(&mut dep, index);
                }
                Arc::clone(&buffer.current)
            });
        }
        let [fetch_constants, vertex_constants, pixel_constants] = resolved_constants;
        state.fetch_constants = fetch_constants;
        state.vertex_constants = vertex_constants;
        state.pixel_constants = pixel_constants;

        for attachment in 0..NUM_ATTACHMENTS {
            let handle = self.bindings.render_targets[attachment];
            state.render_targets[attachment] = handle
                .and_then(|h| self.render_targets.get_mut(h))
                .map(|rt| {
                    // Same-target draw ordering comes from the per-tile FIFO
                    // rules, not the dependency graph; track the reference
                    // for lock/destroy waits only.
                    rt.deps.record_write(index);
                    Arc::clone(&rt.buffer)
                });
        }
        if full_draw {
            for slot_index in 0..MAX_TEXTURE_VIEWS {
                let handle = self.bindings.textures[slot_index];
                if let Some(texture) = handle.and_then(|h| self.textures.get_mut(h)) {
                    texture.deps.add_read(&mut dep, index);
                    state.texture_views[slot_index] = texture.data.ptr() as ShaderResourceHandle;
                }
            }
        }

        state.setup_scissor(dc.tile_mgr.tile_width(), dc.tile_mgr.tile_height());

        // Dependencies come from texture hazards, whose producers finish in
        // the backend, so every dependency waits for full retirement.
        dc.set_dependency(dep);
        dc.dep_complete_draw.store(dep.is_some(), Ordering::Relaxed);
        dc.in_use.store(true, Ordering::Relaxed);
    }

    /// Publish the pending draw to the workers (or run it inline in
    /// single-threaded mode).
    fn queue_draw(&mut self) {
        let slot = self.current_slot.take().expect("no pending draw");
        let shared = Arc::clone(&self.shared);
        let dc = &shared.ring[slot];
        self.last_submitted = Some(dc.draw_index.load(Ordering::Relaxed));

        shared.draw_enqueued.fetch_add(1, Ordering::Release);
        PipelineCounters::bump(&shared.counters.draws_submitted, 1);

        match self.threading {
            ThreadingMode::Single => {
                threads::work_on_fifo_fe(
                    &shared,
                    &shared.worker_fe[0].0,
                    0,
                    &mut self.single_backoff,
                );
                threads::work_on_fifo_be(
                    &shared,
                    &shared.worker_be[0].0,
                    &mut self.single_used_tiles,
                );
            }
            ThreadingMode::Pool => self.wake_workers(),
        }
    }

    /// Attach a completion callback to the next submitted draw; it runs on
    /// the worker that drains the draw's final tile.
    pub fn set_on_complete(&mut self, callback: CompletionCallback) {
        let slot = self.acquire_slot();
        unsafe { self.shared.ring[slot].payload_mut().on_complete = Some(callback) };
    }

    // ----------------------------------------------------------- resources

    pub fn create_render_target(
        &mut self,
        width: u32,
        height: u32,
        format: SurfaceFormat,
    ) -> Result<RenderTargetHandle, render_target::RenderTargetError> {
        let buffer = Arc::new(TileBuffer::new(width, height, format)?);
        Ok(self.render_targets.insert(RenderTarget {
            buffer,
            format,
            deps: Default::default(),
        }))
    }

    pub fn destroy_render_target(&mut self, handle: RenderTargetHandle) {
        let newest = self
            .render_targets
            .get(handle)
            .and_then(|rt| rt.deps.newest_reference());
        if let Some(newest) = newest {
            self.wait_for_draw(newest);
        }
        self.render_targets.remove(handle);
    }

    pub fn create_buffer(&mut self, len: usize, numa_node: u32) -> BufferHandle {
        self.buffers.insert(Buffer {
            current: BufferAlloc::owned(len, numa_node),
            len,
            numa_node,
            deps: Default::default(),
        })
    }

    /// Wrap caller-owned memory without copying.
    ///
    /// # Safety
    /// `ptr` must stay valid for `len` bytes until the buffer is destroyed
    /// and every draw referencing it has retired (`finish` suffices).
    pub unsafe fn create_buffer_from_ptr(&mut self, ptr: *mut u8, len: usize) -> BufferHandle {
        self.buffers.insert(Buffer {
            current: unsafe { BufferAlloc::borrowed(ptr, len) },
            len,
            numa_node: 0,
            deps: Default::default(),
        })
    }

    pub fn destroy_buffer(&mut self, handle: BufferHandle) {
        let newest = self
            .buffers
            .get(handle)
            .and_then(|buffer| buffer.deps.newest_reference());
        if let Some(newest) = newest {
            self.wait_for_draw(newest);
        }
        self.buffers.remove(handle);
    }

    /// Map a buffer for CPU writes according to the lock mode.
    pub fn lock_buffer(
        &mut self,
        handle: BufferHandle,
        mode: LockMode,
    ) -> Result<*mut u8, ResourceError> {
        let Some(buffer) = self.buffers.get(handle) else {
            return Err(ResourceError::InvalidHandle);
        };
        let newest = buffer.deps.newest_reference();
        self.update_last_retired();
        let busy = newest.is_some_and(|index| index >= self.retired);

        match mode {
            LockMode::Wait => {
                if busy {
                    self.wait_for_draw(newest.expect("busy implies a reference"));
                }
            }
            LockMode::NoOverwrite => {}
            LockMode::Discard => {
                if busy {
                    let buffer = self.buffers.get_mut(handle).expect("buffer just looked up");
                    buffer.current = BufferAlloc::owned(buffer.len, buffer.numa_node);
                    buffer.deps = Default::default();
                }
            }
        }
        Ok(self.buffers[handle].current.ptr())
    }

    pub fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        bytes_per_pixel: u32,
    ) -> Result<TextureHandle, ResourceError> {
        if width == 0 || height == 0 || bytes_per_pixel == 0 {
            return Err(ResourceError::ZeroSize);
        }
        let len = width as usize * height as usize * bytes_per_pixel as usize;
        Ok(self.textures.insert(Texture {
            width,
            height,
            bytes_per_pixel,
            data: BufferAlloc::owned(len, 0),
            deps: Default::default(),
        }))
    }

    pub fn destroy_texture(&mut self, handle: TextureHandle) {
        let newest = self
            .textures
            .get(handle)
            .and_then(|texture| texture.deps.newest_reference());
        if let Some(newest) = newest {
            self.wait_for_draw(newest);
        }
        self.textures.remove(handle);
    }

    /// Map a texture's storage, waiting for in-flight references.
    pub fn lock_texture(&mut self, handle: TextureHandle) -> Result<*mut u8, ResourceError> {
        let Some(texture) = self.textures.get(handle) else {
            return Err(ResourceError::InvalidHandle);
        };
        let newest = texture.deps.newest_reference();
        if let Some(newest) = newest {
            self.wait_for_draw(newest);
        }
        Ok(self.textures[handle].data.ptr())
    }

    // --------------------------------------------------------------- state

    pub fn set_vertex_buffer(&mut self, stream: usize, buffer: Option<BufferHandle>) {
        self.bindings.vertex_buffers[stream] = buffer;
    }

    pub fn set_index_buffer(&mut self, buffer: Option<BufferHandle>) {
        self.bindings.index_buffer = buffer;
    }

    pub fn set_fetch_constants(&mut self, buffer: Option<BufferHandle>) {
        self.bindings.fetch_constants = buffer;
    }

    pub fn set_vertex_constants(&mut self, buffer: Option<BufferHandle>) {
        self.bindings.vertex_constants = buffer;
    }

    pub fn set_pixel_constants(&mut self, buffer: Option<BufferHandle>) {
        self.bindings.pixel_constants = buffer;
    }

    pub fn set_render_target(&mut self, attachment: usize, target: Option<RenderTargetHandle>) {
        self.bindings.render_targets[attachment] = target;
    }

    pub fn set_texture_view(&mut self, slot: usize, texture: Option<TextureHandle>) {
        self.bindings.textures[slot] = texture;
    }

    pub fn set_sampler(&mut self, slot: usize, sampler: ShaderResourceHandle) {
        self.pending_state().samplers[slot] = sampler;
    }

    pub fn set_fetch_fn(&mut self, fetch: FetchFn) {
        self.pending_state().fetch_fn = fetch;
    }

    pub fn set_vertex_fn(&mut self, vertex: VertexFn) {
        self.pending_state().vertex_fn = vertex;
    }

    pub fn set_pixel_fn(&mut self, pixel: PixelFn) {
        self.pending_state().pixel_fn = pixel;
    }

    pub fn set_cull_mode(&mut self, mode: CullMode) {
        self.pending_state().cull_mode = mode;
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        let state = self.pending_state();
        state.viewport = viewport;
        state.guardband = Guardband::for_viewport(&viewport);
    }

    /// Scissor rectangle with exclusive right/bottom edges.
    pub fn set_scissor_rect(&mut self, left: i32, top: i32, right: i32, bottom: i32) {
        self.pending_state().scissor_rect = Bbox::new(left, top, right, bottom);
    }

    pub fn enable_scissor(&mut self, enable: bool) {
        self.pending_state().scissor_enable = enable;
    }

    pub fn set_linkage_mask_front(&mut self, mask: u32) {
        self.pending_state().linkage_mask_front = mask;
    }

    pub fn set_linkage_mask_back(&mut self, mask: u32) {
        self.pending_state().linkage_mask_back = mask;
    }

    pub fn set_index_type(&mut self, index_type: IndexType) {
        self.pending_state().index_type = index_type;
    }

    // --------------------------------------------------------------- draws

    /// Draw `prim_count` primitives starting at `start_vertex`. Split into
    /// chunks of `MAX_PRIMS_PER_DRAW`, one draw context each.
    pub fn draw(&mut self, topology: PrimitiveTopology, start_vertex: u32, prim_count: u32) {
        if prim_count == 0 {
            self.drop_submission(PipelineError::EmptyDraw);
            return;
        }
        self.draw_common(topology, start_vertex, prim_count, 0, VertexSource::Direct);
    }

    pub fn draw_indexed(
        &mut self,
        topology: PrimitiveTopology,
        index_type: IndexType,
        num_indices: u32,
        index_offset: u32,
    ) {
        self.draw_indexed_instanced(topology, index_type, num_indices, 1, index_offset);
    }

    pub fn draw_indexed_instanced(
        &mut self,
        topology: PrimitiveTopology,
        index_type: IndexType,
        num_indices: u32,
        num_instances: u32,
        index_offset: u32,
    ) {
        let prim_count = topology.num_primitives(num_indices);
        if prim_count == 0 || num_instances == 0 {
            self.drop_submission(PipelineError::EmptyDraw);
            return;
        }
        let Some(index_buffer) = self.bindings.index_buffer.and_then(|h| self.buffers.get(h))
        else {
            self.drop_submission(PipelineError::MissingIndexBuffer);
            return;
        };
        let bytes_needed =
            (index_offset as usize + num_indices as usize) * index_type.size_in_bytes() as usize;
        if bytes_needed > index_buffer.current.len() {
            self.drop_submission(PipelineError::IndexRangeOutOfBounds);
            return;
        }

        self.pending_state().index_type = index_type;
        for instance in 0..num_instances {
            self.draw_common(
                topology,
                0,
                prim_count,
                instance,
                VertexSource::Indexed { index_offset },
            );
        }
    }

    /// Is any shader stage of the pending draw still the failing default?
    /// Drawing through one would mis-shade silently in release.
    fn pending_shaders_unbound(&mut self) -> bool {
        let state = self.pending_state();
        std::ptr::fn_addr_eq(state.fetch_fn, crate::shader::unbound_fetch as FetchFn)
            || std::ptr::fn_addr_eq(state.vertex_fn, crate::shader::unbound_vertex as VertexFn)
            || std::ptr::fn_addr_eq(state.pixel_fn, crate::shader::unbound_pixel as PixelFn)
    }

    fn draw_common(
        &mut self,
        topology: PrimitiveTopology,
        start_vertex: u32,
        prim_count: u32,
        instance: u32,
        source: VertexSource,
    ) {
        if self.pending_shaders_unbound() {
            self.drop_submission(PipelineError::UnboundShader);
            return;
        }
        let mut remaining = prim_count;
        let mut start_prim = 0;
        let mut last_index = 0;
        while remaining > 0 {
            let chunk = remaining.min(MAX_PRIMS_PER_DRAW);
            let slot = self.acquire_slot();
            self.pending_state().topology = topology;
            self.init_submission(slot, true);
            unsafe {
                self.shared.ring[slot].payload_mut().fe_work = Some(FeWork {
                    func: frontend::process_draw,
                    desc: FeWorkDesc::Draw(FeDrawDesc {
                        start_vertex,
                        start_prim,
                        prim_count: chunk,
                        instance,
                        source,
                    }),
                });
            }
            last_index = self.shared.ring[slot].draw_index.load(Ordering::Relaxed);
            self.queue_draw();
            remaining -= chunk;
            start_prim += chunk;
        }

        // Draws sourcing user-pointer buffers must not return while the
        // frontend can still read the caller's memory.
        if self.draw_reads_borrowed_memory() {
            let shared = Arc::clone(&self.shared);
            while !shared.dc(last_index).done_fe.load(Ordering::Acquire)
                && !self.draw_retired(last_index)
            {
                self.wake_workers();
                std::hint::spin_loop();
            }
        }
    }

    fn draw_reads_borrowed_memory(&self) -> bool {
        let buffer_is_borrowed = |handle: Option<BufferHandle>| {
            handle
                .and_then(|h| self.buffers.get(h))
                .is_some_and(|buffer| buffer.current.is_borrowed())
        };
        self.bindings
            .vertex_buffers
            .iter()
            .any(|handle| buffer_is_borrowed(*handle))
            || buffer_is_borrowed(self.bindings.index_buffer)
    }

    // --------------------------------------------- clear / copy / present

    /// Dimensions of a bound attachment, for pre-submit validation.
    fn bound_target_dims(&self, attachments: &[usize]) -> Option<(u32, u32)> {
        for &attachment in attachments {
            if let Some(rt) = self.bindings.render_targets[attachment]
                .and_then(|h| self.render_targets.get(h))
            {
                return Some((rt.buffer.api_width(), rt.buffer.api_height()));
            }
        }
        None
    }

    /// Clear the bound attachments. With `use_scissor` only pixels inside
    /// the scissor rectangle are touched; otherwise the whole target is.
    pub fn clear(&mut self, mask: ClearMask, color: [f32; 4], depth: f32, use_scissor: bool) {
        let Some((width, height)) = self.bound_target_dims(&[ATTACHMENT_COLOR, ATTACHMENT_DEPTH])
        else {
            self.drop_submission(PipelineError::MissingRenderTarget);
            return;
        };

        let slot = self.acquire_slot();
        self.init_submission(slot, false);

        let rect = if use_scissor {
            unsafe { self.shared.ring[slot].payload_mut().state.scissor_in_pixels }
        } else {
            Bbox::new(0, 0, width as i32 - 1, height as i32 - 1)
        };
        let clear = ClearDesc {
            mask,
            color: pack_bgra8(color),
            depth_bits: depth.to_bits(),
            rect,
        };
        unsafe {
            self.shared.ring[slot].payload_mut().fe_work = Some(FeWork {
                func: frontend::process_clear,
                desc: FeWorkDesc::Clear(clear),
            });
        }
        self.queue_draw();
    }

    /// Deswizzle the color target into caller memory (BGRA8, y-flipped for
    /// GL) and wait for the transfer to retire.
    pub fn present_to_linear(&mut self, dst: &mut [u8], pitch: usize) -> Result<(), PipelineError> {
        let Some((_, height)) = self.bound_target_dims(&[ATTACHMENT_COLOR]) else {
            return Err(self.drop_submission(PipelineError::MissingRenderTarget));
        };
        if dst.len() < pitch * height as usize {
            return Err(self.drop_submission(PipelineError::DestinationTooSmall));
        }

        let slot = self.acquire_slot();
        self.init_submission(slot, false);
        unsafe {
            self.shared.ring[slot].payload_mut().fe_work = Some(FeWork {
                func: frontend::process_store,
                desc: FeWorkDesc::Store(StoreDesc {
                    dst: dst.as_mut_ptr(),
                    pitch,
                }),
            });
        }
        let index = self.shared.ring[slot].draw_index.load(Ordering::Relaxed);
        self.queue_draw();
        // The borrow of `dst` ends when this call returns, so the transfer
        // must be fully drained first.
        self.wait_for_draw(index);
        Ok(())
    }

    /// Copy a rectangle of an attachment into caller memory, then wait for
    /// the copy to retire.
    pub fn copy_to_linear(
        &mut self,
        attachment: usize,
        src: Bbox,
        dst: &mut [u8],
        dst_pitch: usize,
        dst_format: SurfaceFormat,
    ) -> Result<(), PipelineError> {
        if self.bound_target_dims(&[attachment]).is_none() {
            return Err(self.drop_submission(PipelineError::MissingRenderTarget));
        }
        let rows = (src.bottom - src.top + 1).max(0) as usize;
        if src.is_empty() || dst.len() < rows * dst_pitch {
            return Err(self.drop_submission(PipelineError::DestinationTooSmall));
        }

        let slot = self.acquire_slot();
        self.init_submission(slot, false);
        unsafe {
            self.shared.ring[slot].payload_mut().fe_work = Some(FeWork {
                func: frontend::process_copy,
                desc: FeWorkDesc::Copy(CopyDesc {
                    dst: dst.as_mut_ptr(),
                    dst_pitch,
                    attachment,
                    src,
                    dst_x: 0,
                    dst_y: 0,
                    dst_format,
                }),
            });
        }
        let index = self.shared.ring[slot].draw_index.load(Ordering::Relaxed);
        self.queue_draw();
        self.wait_for_draw(index);
        Ok(())
    }

    /// Copy a rectangle of an attachment into a texture's storage. Ordered
    /// by the dependency graph; does not block.
    pub fn copy_to_texture(
        &mut self,
        attachment: usize,
        src: Bbox,
        texture: TextureHandle,
        dst_x: i32,
        dst_y: i32,
    ) -> Result<(), ResourceError> {
        if !self.textures.contains_key(texture) {
            return Err(ResourceError::InvalidHandle);
        }

        let slot = self.acquire_slot();
        self.init_submission(slot, false);

        let shared = Arc::clone(&self.shared);
        let dc = &shared.ring[slot];
        let index = dc.draw_index.load(Ordering::Relaxed);
        let texture_record = self.textures.get_mut(texture).expect("texture just checked");
        let mut dep = dc.dependency();
        texture_record.deps.add_write(&mut dep, index);
        dc.set_dependency(dep);
        dc.dep_complete_draw.store(dep.is_some(), Ordering::Relaxed);

        let desc = CopyDesc {
            dst: texture_record.data.ptr(),
            dst_pitch: texture_record.width as usize * texture_record.bytes_per_pixel as usize,
            attachment,
            src,
            dst_x,
            dst_y,
            dst_format: SurfaceFormat::Bgra8Unorm,
        };
        unsafe {
            dc.payload_mut().fe_work = Some(FeWork {
                func: frontend::process_copy,
                desc: FeWorkDesc::Copy(desc),
            });
        }
        self.queue_draw();
        Ok(())
    }

    /// The lane width of the shader contracts.
    pub fn lane_width(&self) -> usize {
        model::simd::LANES
    }

    pub fn driver(&self) -> DriverType {
        self.driver
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        {
            let _guard = self.shared.wait_lock.lock().expect("wait lock");
            self.shared.shutdown.store(true, Ordering::Release);
            self.shared.fifos_not_empty.notify_all();
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        tracing::info!("context destroyed");
    }
}

fn pack_bgra8(color: [f32; 4]) -> u32 {
    let to_byte = |v: f32| (v.clamp(0.0, 1.0) * 255.0 + 0.5) as u32;
    to_byte(color[2])
        | (to_byte(color[1]) << 8)
        | (to_byte(color[0]) << 16)
        | (to_byte(color[3]) << 24)
}
