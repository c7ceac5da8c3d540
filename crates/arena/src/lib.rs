//! Per-draw bump allocator. Every draw context owns one arena; the frontend
//! worker that runs the draw allocates triangle and interpolation buffers out
//! of it, backend workers only read those buffers, and the API thread resets
//! the arena when it reuses the draw slot after retirement.

use std::alloc::{Layout, alloc, dealloc, handle_alloc_error};
use std::cell::UnsafeCell;
use std::ptr::NonNull;

/// Arena blocks are always lane-width (4 x f32) aligned.
const BLOCK_ALIGN: usize = 16;
const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

struct Block {
    mem: NonNull<u8>,
    size: usize,
    offset: usize,
}

impl Block {
    fn layout(size: usize) -> Layout {
        // Size is always a multiple of BLOCK_ALIGN, so this cannot fail.
        Layout::from_size_align(size, BLOCK_ALIGN).expect("arena block layout")
    }

    fn allocate(size: usize) -> Block {
        let layout = Self::layout(size);
        let mem = unsafe { alloc(layout) };
        let Some(mem) = NonNull::new(mem) else {
            // Allocation failure mid-draw has no in-band error path.
            handle_alloc_error(layout);
        };
        Block {
            mem,
            size,
            offset: 0,
        }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        unsafe { dealloc(self.mem.as_ptr(), Self::layout(self.size)) };
    }
}

struct Inner {
    current: Option<Block>,
    used: Vec<Block>,
    // Total block bytes mapped since the last full release; the next first
    // block after a release is sized to this peak.
    mem_used: usize,
}

/// Bump allocator with block-list growth and peak-sized reuse.
///
/// Interior mutability with a single-mutator contract: exactly one thread
/// allocates at a time (the frontend worker between FE claim and `done_fe`,
/// or the API thread between retirement and enqueue). Backend workers only
/// dereference pointers handed to them through work items, which the
/// `done_fe` release store publishes.
pub struct DrawArena {
    inner: UnsafeCell<Inner>,
}

unsafe impl Send for DrawArena {}
unsafe impl Sync for DrawArena {}

impl Default for DrawArena {
    fn default() -> Self {
        Self::new()
    }
}

impl DrawArena {
    pub fn new() -> Self {
        DrawArena {
            inner: UnsafeCell::new(Inner {
                current: None,
                used: Vec::new(),
                mem_used: 0,
            }),
        }
    }

    /// Allocate `size` bytes with the requested alignment (at most the block
    /// alignment). The pointer stays valid until the next `reset`.
    pub fn alloc_aligned(&self, size: usize, align: usize) -> NonNull<u8> {
        debug_assert!(align.is_power_of_two() && align <= BLOCK_ALIGN);
        // Single-mutator contract; see the type docs.
        let inner = unsafe { &mut *self.inner.get() };

        if let Some(current) = inner.current.as_mut() {
            let offset = (current.offset + align - 1) & !(align - 1);
            if offset + size < current.size {
                current.offset = offset + size;
                return unsafe { NonNull::new_unchecked(current.mem.as_ptr().add(offset)) };
            }
            // Exhausted; retire the block and map a fresh one.
            inner.used.push(inner.current.take().expect("current block"));
        }

        let mut default_size = DEFAULT_BLOCK_SIZE;
        if inner.used.is_empty() {
            // First block after a full release: grow straight to the peak of
            // the previous cycle so steady-state draws stay single-block.
            default_size = default_size.max(inner.mem_used);
            inner.mem_used = 0;
        }
        let block_size = (size.max(default_size) + BLOCK_ALIGN - 1) & !(BLOCK_ALIGN - 1);

        let mut block = Block::allocate(block_size);
        block.offset = size;
        inner.mem_used += block_size;
        let mem = block.mem;
        inner.current = Some(block);
        mem
    }

    /// Allocate a lane-aligned f32 buffer.
    pub fn alloc_f32_slice(&self, len: usize) -> NonNull<f32> {
        self.alloc_aligned(len * size_of::<f32>(), BLOCK_ALIGN).cast()
    }

    /// Rewind the arena. Keeps at most one live block (sized to the previous
    /// peak) and frees the rest; this is the only path that releases memory.
    pub fn reset(&self) {
        let inner = unsafe { &mut *self.inner.get() };
        if let Some(current) = inner.current.as_mut() {
            current.offset = 0;
            if !inner.used.is_empty() {
                // Growth happened this cycle; release everything so the next
                // cycle starts with one block of the full peak size.
                inner.used.push(inner.current.take().expect("current block"));
            }
        }
        inner.used.clear();
    }

    /// Bytes handed out from the current block; test hook.
    pub fn current_block_offset(&self) -> usize {
        let inner = unsafe { &*self.inner.get() };
        inner.current.as_ref().map_or(0, |block| block.offset)
    }
}
