//! Per-draw macro-tile work queues. Each macro tile owns a block-list FIFO
//! of backend work items; one frontend worker produces into it, backend
//! workers contend for a CAS try-lock and drain it in order. The manager
//! tracks produced/consumed totals so the last drained tile can detect draw
//! retirement.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};

use model::macro_tile_id;

/// Entries per FIFO block.
const BLOCK_SIZE: usize = 64;

type Block<T> = Box<[MaybeUninit<T>; BLOCK_SIZE]>;

struct QueueState<T> {
    blocks: Vec<Block<T>>,
    head: usize,
    tail: usize,
    tail_block: usize,
}

fn new_block<T>() -> Block<T> {
    // MaybeUninit contents are never read before being written.
    Box::new([const { MaybeUninit::uninit() }; BLOCK_SIZE])
}

/// Single-producer FIFO with a try-lock drain protocol.
///
/// The producer role (enqueue) belongs to whichever worker holds the draw's
/// FE lock; consumers must win `try_lock` before peeking. `num_queued` is
/// published with release/acquire pairs so a consumer that observed a
/// non-zero count also observes the entries.
pub struct WorkQueue<T> {
    lock: AtomicU32,
    num_entries: AtomicU32,
    state: UnsafeCell<QueueState<T>>,
}

unsafe impl<T: Send + Copy> Send for WorkQueue<T> {}
unsafe impl<T: Send + Copy> Sync for WorkQueue<T> {}

impl<T: Copy> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy> WorkQueue<T> {
    pub fn new() -> Self {
        WorkQueue {
            lock: AtomicU32::new(0),
            num_entries: AtomicU32::new(0),
            state: UnsafeCell::new(QueueState {
                blocks: vec![new_block()],
                head: 0,
                tail: 0,
                tail_block: 0,
            }),
        }
    }

    pub fn num_queued(&self) -> u32 {
        self.num_entries.load(Ordering::Acquire)
    }

    /// Try to become the queue's consumer. 0 -> 1 CAS; no blocking.
    pub fn try_lock(&self) -> bool {
        if self.lock.load(Ordering::Relaxed) != 0 {
            return false;
        }
        self.lock
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn unlock(&self) {
        self.lock.store(0, Ordering::Release);
    }

    /// Append one item. Producer only (FE lock holder).
    pub fn enqueue(&self, item: T) {
        let state = unsafe { &mut *self.state.get() };
        state.blocks[state.tail_block][state.tail].write(item);
        state.tail += 1;
        if state.tail == BLOCK_SIZE {
            state.tail_block += 1;
            if state.tail_block == state.blocks.len() {
                state.blocks.push(new_block());
            }
            state.tail = 0;
        }
        self.num_entries.fetch_add(1, Ordering::Release);
    }

    /// Copy out the item at the head without consuming it. Lock holder only.
    pub fn peek(&self) -> Option<T> {
        if self.num_queued() == 0 {
            return None;
        }
        let state = unsafe { &*self.state.get() };
        let block = state.head / BLOCK_SIZE;
        let slot = state.head % BLOCK_SIZE;
        Some(unsafe { state.blocks[block][slot].assume_init_read() })
    }

    /// Consume the item last returned by `peek`. Lock holder only.
    pub fn dequeue(&self) {
        let state = unsafe { &mut *self.state.get() };
        state.head += 1;
        self.num_entries.fetch_sub(1, Ordering::Release);
    }

    /// Reset the queue and release the lock in one step. Blocks are kept for
    /// reuse. Lock holder only; after this the holder must re-win `try_lock`
    /// to touch the queue again.
    pub fn clear_and_unlock(&self) {
        let state = unsafe { &mut *self.state.get() };
        state.head = 0;
        state.tail = 0;
        state.tail_block = 0;
        self.num_entries.store(0, Ordering::Relaxed);
        self.lock.store(0, Ordering::Release);
    }
}

/// One macro tile: its FIFO plus producer/consumer item counts. Both counts
/// return to zero when the tile completes, so `fe == be` doubles as the
/// "tile already drained for this draw" test.
pub struct MacroTile<T> {
    pub fifo: WorkQueue<T>,
    pub work_items_fe: AtomicU32,
    pub work_items_be: AtomicU32,
}

impl<T: Copy> Default for MacroTile<T> {
    fn default() -> Self {
        MacroTile {
            fifo: WorkQueue::new(),
            work_items_fe: AtomicU32::new(0),
            work_items_be: AtomicU32::new(0),
        }
    }
}

impl<T: Copy> MacroTile<T> {
    pub fn is_complete(&self) -> bool {
        self.work_items_be.load(Ordering::Acquire) == self.work_items_fe.load(Ordering::Acquire)
    }
}

/// Per-draw manager of macro-tile FIFOs.
///
/// The tile map and used list are only restructured by the draw's frontend
/// worker (or the API thread between retirement and re-enqueue); backend
/// workers read them after observing the draw's FE-done flag, which the
/// worker protocol orders after all frontend writes.
pub struct MacroTileManager<T> {
    tiles: UnsafeCell<HashMap<u32, MacroTile<T>>>,
    used_tiles: UnsafeCell<Vec<u32>>,
    produced: AtomicU32,
    consumed: AtomicU32,
    tile_width: u32,
    tile_height: u32,
}

unsafe impl<T: Send + Copy> Send for MacroTileManager<T> {}
unsafe impl<T: Send + Copy> Sync for MacroTileManager<T> {}

impl<T: Copy> Default for MacroTileManager<T> {
    fn default() -> Self {
        MacroTileManager {
            tiles: UnsafeCell::new(HashMap::new()),
            used_tiles: UnsafeCell::new(Vec::new()),
            produced: AtomicU32::new(0),
            consumed: AtomicU32::new(0),
            tile_width: model::MACROTILE_DIM,
            tile_height: model::MACROTILE_DIM,
        }
    }
}

impl<T: Copy> MacroTileManager<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepare for a new draw: zero the accounting and pick the macro-tile
    /// dimensions. Tiles (and their FIFO blocks) are retained for reuse.
    pub fn initialize(&self) {
        let used = unsafe { &mut *self.used_tiles.get() };
        used.clear();
        self.produced.store(0, Ordering::Relaxed);
        self.consumed.store(0, Ordering::Relaxed);
    }

    /// Macro tile width in pixels.
    pub fn tile_width(&self) -> u32 {
        self.tile_width
    }

    /// Macro tile height in pixels.
    pub fn tile_height(&self) -> u32 {
        self.tile_height
    }

    /// Enqueue one work item onto macro tile (x, y). Frontend only.
    pub fn enqueue(&self, x: u32, y: u32, item: T) {
        let id = macro_tile_id(x, y);
        let tiles = unsafe { &mut *self.tiles.get() };
        let tile = tiles.entry(id).or_default();
        let previous = tile.work_items_fe.fetch_add(1, Ordering::Relaxed);
        if previous == 0 {
            unsafe { (*self.used_tiles.get()).push(id) };
        }
        self.produced.fetch_add(1, Ordering::Release);
        tile.fifo.enqueue(item);
    }

    /// Tiles that received work since the last `initialize`, in first-touch
    /// order. Valid once the draw's frontend has finished.
    pub fn used_tiles(&self) -> &[u32] {
        unsafe { &*self.used_tiles.get() }
    }

    pub fn tile(&self, id: u32) -> &MacroTile<T> {
        let tiles = unsafe { &*self.tiles.get() };
        tiles.get(&id).expect("macro tile was never enqueued")
    }

    pub fn is_work_complete(&self) -> bool {
        self.consumed.load(Ordering::Acquire) == self.produced.load(Ordering::Acquire)
    }

    /// Fold the drained tile's production count into the consumed total and
    /// reset the tile. Returns true when this was the draw's last tile.
    /// Caller must hold the tile's FIFO lock; the reset releases it.
    pub fn mark_tile_complete(&self, id: u32) -> bool {
        let tile = self.tile(id);
        let items = tile.work_items_fe.load(Ordering::Relaxed);
        let consumed = self.consumed.fetch_add(items, Ordering::AcqRel) + items;

        tile.work_items_fe.store(0, Ordering::Relaxed);
        tile.work_items_be.store(0, Ordering::Relaxed);
        tile.fifo.clear_and_unlock();

        consumed == self.produced.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_preserves_order_across_blocks() {
        let queue: WorkQueue<u32> = WorkQueue::new();
        for i in 0..(BLOCK_SIZE as u32 * 3 + 5) {
            queue.enqueue(i);
        }
        assert!(queue.try_lock());
        let mut expected = 0;
        while let Some(item) = queue.peek() {
            assert_eq!(item, expected);
            queue.dequeue();
            expected += 1;
        }
        assert_eq!(expected, BLOCK_SIZE as u32 * 3 + 5);
        queue.unlock();
    }

    #[test]
    fn lock_is_exclusive_until_released() {
        let queue: WorkQueue<u32> = WorkQueue::new();
        assert!(queue.try_lock());
        assert!(!queue.try_lock());
        queue.unlock();
        assert!(queue.try_lock());
    }

    #[test]
    fn clear_releases_the_lock_and_empties() {
        let queue: WorkQueue<u32> = WorkQueue::new();
        queue.enqueue(7);
        assert!(queue.try_lock());
        queue.clear_and_unlock();
        assert_eq!(queue.num_queued(), 0);
        assert!(queue.try_lock());
        assert_eq!(queue.peek(), None);
        queue.unlock();
    }

    #[test]
    fn blocks_are_reused_after_clear() {
        let queue: WorkQueue<u32> = WorkQueue::new();
        for i in 0..(BLOCK_SIZE as u32 + 1) {
            queue.enqueue(i);
        }
        assert!(queue.try_lock());
        queue.clear_and_unlock();
        for i in 0..(BLOCK_SIZE as u32 + 1) {
            queue.enqueue(i * 2);
        }
        assert!(queue.try_lock());
        assert_eq!(queue.peek(), Some(0));
        queue.dequeue();
        assert_eq!(queue.peek(), Some(2));
        queue.unlock();
    }

    #[test]
    fn manager_detects_last_tile_retirement() {
        let mgr: MacroTileManager<u32> = MacroTileManager::new();
        mgr.initialize();
        mgr.enqueue(0, 0, 1);
        mgr.enqueue(0, 0, 2);
        mgr.enqueue(1, 0, 3);
        assert!(!mgr.is_work_complete());
        assert_eq!(mgr.used_tiles().len(), 2);

        let first = mgr.used_tiles()[0];
        let second = mgr.used_tiles()[1];
        assert!(mgr.tile(first).fifo.try_lock());
        assert!(!mgr.mark_tile_complete(first));
        assert!(mgr.tile(second).fifo.try_lock());
        assert!(mgr.mark_tile_complete(second));
        assert!(mgr.is_work_complete());
    }

    #[test]
    fn completed_tiles_read_as_complete() {
        let mgr: MacroTileManager<u32> = MacroTileManager::new();
        mgr.initialize();
        mgr.enqueue(2, 3, 9);
        let id = mgr.used_tiles()[0];
        assert!(!mgr.tile(id).is_complete());
        assert!(mgr.tile(id).fifo.try_lock());
        mgr.mark_tile_complete(id);
        assert!(mgr.tile(id).is_complete());
    }

    #[test]
    fn initialize_resets_accounting_but_keeps_tiles() {
        let mgr: MacroTileManager<u32> = MacroTileManager::new();
        mgr.initialize();
        mgr.enqueue(0, 0, 1);
        let id = mgr.used_tiles()[0];
        assert!(mgr.tile(id).fifo.try_lock());
        mgr.mark_tile_complete(id);

        mgr.initialize();
        assert!(mgr.used_tiles().is_empty());
        assert!(mgr.is_work_complete());
        mgr.enqueue(0, 0, 5);
        assert_eq!(mgr.used_tiles().len(), 1);
        assert_eq!(mgr.tile(id).fifo.num_queued(), 1);
    }
}
