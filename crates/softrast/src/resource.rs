//! Client-visible resources: buffers, textures and render targets, addressed
//! by slotmap handles. Records also carry the read/write dependency history
//! that the draw scheduler consults.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::Arc;

use model::SurfaceFormat;
use render_target::TileBuffer;
use slotmap::new_key_type;
use smallvec::SmallVec;

use crate::draw::DrawIndex;

new_key_type! {
    pub struct BufferHandle;
    pub struct TextureHandle;
    pub struct RenderTargetHandle;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceError {
    InvalidHandle,
    ZeroSize,
    UnsupportedFormat,
}

impl fmt::Display for ResourceError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceError::InvalidHandle => write!(formatter, "stale or foreign resource handle"),
            ResourceError::ZeroSize => write!(formatter, "resource dimensions must be non-zero"),
            ResourceError::UnsupportedFormat => write!(formatter, "unsupported resource format"),
        }
    }
}

impl std::error::Error for ResourceError {}

/// How a buffer lock behaves when the backing store is referenced by draws
/// still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Wait for in-flight references to retire, then return the current
    /// backing store.
    Wait,
    /// Return the current store immediately; the caller promises not to
    /// touch bytes any in-flight draw reads.
    NoOverwrite,
    /// Return a fresh backing store if the current one is referenced, else
    /// the current one.
    Discard,
}

enum Storage {
    /// Heap storage kept as f32 words so vertex streams read aligned.
    Owned { data: UnsafeCell<Box<[f32]>>, len: usize },
    /// Client memory; the creator promises validity until destroy.
    Borrowed { ptr: *mut u8, len: usize },
}

/// One backing allocation of a buffer. Draw states hold `Arc`s to the
/// allocation (not the handle), so a discard-lock can swap the buffer's
/// current allocation without disturbing draws in flight.
pub struct BufferAlloc {
    storage: Storage,
    pub numa_node: u32,
}

// The API thread only writes a backing store while no in-flight draw
// references it (the lock protocol enforces this); workers only read.
unsafe impl Send for BufferAlloc {}
unsafe impl Sync for BufferAlloc {}

impl BufferAlloc {
    pub fn owned(len: usize, numa_node: u32) -> Arc<BufferAlloc> {
        let words = len.div_ceil(size_of::<f32>());
        Arc::new(BufferAlloc {
            storage: Storage::Owned {
                data: UnsafeCell::new(vec![0f32; words].into_boxed_slice()),
                len,
            },
            numa_node,
        })
    }

    /// # Safety
    /// `ptr` must stay valid for `len` bytes until the owning buffer is
    /// destroyed and all draws referencing it have retired.
    pub unsafe fn borrowed(ptr: *mut u8, len: usize) -> Arc<BufferAlloc> {
        Arc::new(BufferAlloc {
            storage: Storage::Borrowed { ptr, len },
            numa_node: 0,
        })
    }

    pub fn ptr(&self) -> *mut u8 {
        match &self.storage {
            Storage::Owned { data, .. } => unsafe { (*data.get()).as_mut_ptr().cast() },
            Storage::Borrowed { ptr, .. } => *ptr,
        }
    }

    pub fn len(&self) -> usize {
        match &self.storage {
            Storage::Owned { len, .. } => *len,
            Storage::Borrowed { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Does this allocation borrow client memory instead of owning it?
    pub fn is_borrowed(&self) -> bool {
        matches!(self.storage, Storage::Borrowed { .. })
    }
}

/// Read/write history of one resource, in draw submission order.
#[derive(Default)]
pub struct DependencyTracker {
    pub last_writer: Option<DrawIndex>,
    pub readers: SmallVec<[DrawIndex; 4]>,
}

impl DependencyTracker {
    /// Record a read by `draw` and fold the required predecessor into `dep`.
    pub fn add_read(&mut self, dep: &mut Option<DrawIndex>, draw: DrawIndex) {
        if let Some(writer) = self.last_writer {
            raise(dep, writer);
        }
        if !self.readers.contains(&draw) {
            self.readers.push(draw);
        }
    }

    /// Record a write by `draw`; the writer must wait for the previous
    /// writer and every recorded reader.
    pub fn add_write(&mut self, dep: &mut Option<DrawIndex>, draw: DrawIndex) {
        if let Some(writer) = self.last_writer {
            raise(dep, writer);
        }
        for &reader in &self.readers {
            raise(dep, reader);
        }
        self.readers.clear();
        self.last_writer = Some(draw);
    }

    /// Record a write whose ordering is already guaranteed elsewhere (render
    /// targets: hazards between draws on the same target are serialized per
    /// macro tile by the FIFO rules). Only lock/destroy busy tracking needs
    /// the reference.
    pub fn record_write(&mut self, draw: DrawIndex) {
        self.readers.clear();
        self.last_writer = Some(draw);
    }

    /// Newest draw referencing the resource, if any.
    pub fn newest_reference(&self) -> Option<DrawIndex> {
        let mut newest = self.last_writer;
        for &reader in &self.readers {
            raise(&mut newest, reader);
        }
        newest
    }
}

fn raise(dep: &mut Option<DrawIndex>, candidate: DrawIndex) {
    match dep {
        Some(current) if *current >= candidate => {}
        _ => *dep = Some(candidate),
    }
}

pub struct Buffer {
    pub current: Arc<BufferAlloc>,
    pub len: usize,
    pub numa_node: u32,
    pub deps: DependencyTracker,
}

pub struct Texture {
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
    pub data: Arc<BufferAlloc>,
    pub deps: DependencyTracker,
}

pub struct RenderTarget {
    pub buffer: Arc<TileBuffer>,
    pub format: SurfaceFormat,
    pub deps: DependencyTracker,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_after_write_depends_on_the_writer() {
        let mut deps = DependencyTracker::default();
        let mut dep = None;
        deps.add_write(&mut dep, 3);
        assert_eq!(dep, None);

        let mut dep = None;
        deps.add_read(&mut dep, 5);
        assert_eq!(dep, Some(3));
    }

    #[test]
    fn write_after_read_depends_on_every_reader() {
        let mut deps = DependencyTracker::default();
        let mut dep = None;
        deps.add_read(&mut dep, 2);
        deps.add_read(&mut dep, 4);

        let mut dep = None;
        deps.add_write(&mut dep, 6);
        assert_eq!(dep, Some(4));
        assert!(deps.readers.is_empty());
        assert_eq!(deps.last_writer, Some(6));
    }

    #[test]
    fn newest_reference_tracks_readers_and_writer() {
        let mut deps = DependencyTracker::default();
        let mut dep = None;
        deps.add_write(&mut dep, 1);
        deps.add_read(&mut dep, 7);
        assert_eq!(deps.newest_reference(), Some(7));
    }
}
