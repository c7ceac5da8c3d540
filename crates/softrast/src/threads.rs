//! Worker pool and the FE/BE scheduling protocol. Workers spin briefly, then
//! block on the context condvar; each loop iteration drains ordered backend
//! work first and then tries to claim a frontend.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use model::Bbox;
use smallvec::SmallVec;

use crate::config::{ContextConfig, FE_BACKOFF_COUNT, SPIN_LOOP_COUNT, WORKER_THREAD_OFFSET};
use crate::context::Shared;
use crate::draw::{DrawContext, DrawIndex, FeWorkDesc};

/// Per-worker scratch set of macro-tile ids; rebuilt on every BE pass.
#[derive(Default)]
pub(crate) struct UsedTiles(SmallVec<[u32; 64]>);

impl UsedTiles {
    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn contains(&self, id: u32) -> bool {
        self.0.contains(&id)
    }

    pub fn insert(&mut self, id: u32) {
        if !self.0.contains(&id) {
            self.0.push(id);
        }
    }

    pub fn remove(&mut self, id: u32) {
        if let Some(pos) = self.0.iter().position(|&t| t == id) {
            self.0.swap_remove(pos);
        }
    }
}

/// Pin the current thread to one core. Best effort; only Linux pins.
#[cfg(target_os = "linux")]
pub(crate) fn bind_thread(core: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core % libc::CPU_SETSIZE as usize, &mut set);
        libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), &set);
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn bind_thread(_core: usize) {}

/// NUMA node count. Linux reads sysfs; elsewhere a single node is assumed.
pub(crate) fn numa_node_count() -> u32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(entries) = std::fs::read_dir("/sys/devices/system/node") {
            let nodes = entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| {
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    name.strip_prefix("node")
                        .is_some_and(|suffix| suffix.chars().all(|c| c.is_ascii_digit()))
                })
                .count() as u32;
            if nodes > 0 {
                return nodes;
            }
        }
    }
    1
}

/// The NUMA node a worker should prefer for a draw's frontend: the primary
/// vertex buffer's node, until the worker's backoff runs out.
fn preferred_node(dc: &DrawContext, worker_node: u32, backoff: u32) -> u32 {
    if backoff <= FE_BACKOFF_COUNT
        && matches!(dc.fe_work().desc, FeWorkDesc::Draw(_))
        && let Some(buffer) = dc.state().vertex_buffers[0].as_ref()
    {
        return buffer.numa_node;
    }
    worker_node
}

/// Claim and run frontends. Any worker may run any unclaimed FE; the claim
/// CAS is never released, it marks the draw's frontend as taken forever.
pub(crate) fn work_on_fifo_fe(
    shared: &Shared,
    cursor: &AtomicU64,
    worker_node: u32,
    backoff: &mut u32,
) {
    let enqueued = shared.draw_enqueued.load(Ordering::Acquire);
    let mut cur = cursor.load(Ordering::Relaxed);
    while cur < enqueued {
        let dc = shared.dc(cur);
        if dc.done_fe.load(Ordering::Acquire) || dc.fe_lock.load(Ordering::Relaxed) != 0 {
            cur += 1;
        } else {
            break;
        }
    }
    cursor.store(cur, Ordering::Relaxed);

    *backoff += 1;

    let mut draw = cur;
    while draw < enqueued {
        let dc = shared.dc(draw);
        if dc.fe_lock.load(Ordering::Relaxed) == 0
            && (shared.num_numa_nodes <= 1 || preferred_node(dc, worker_node, *backoff) == worker_node)
            && dc
                .fe_lock
                .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            let work = dc.fe_work();
            (work.func)(dc, &work.desc);
            *backoff = 0;
        }
        draw += 1;
    }
}

/// Does `dc` have an unmet dependency? `last_retired` is the index of the
/// first draw not yet known-retired by this worker.
fn dependency_unmet(shared: &Shared, dc: &DrawContext, last_retired: DrawIndex) -> bool {
    let Some(dep) = dc.dependency() else {
        return false;
    };
    if dep < last_retired {
        return false;
    }
    if dc.dep_complete_draw.load(Ordering::Acquire) {
        // Needs full retirement, which `last_retired` already bounds.
        true
    } else {
        // FE completion is enough. The dependency is younger than
        // last_retired, so its slot has not been recycled.
        !shared.dc(dep).done_fe.load(Ordering::Acquire)
    }
}

/// Drain ordered backend work.
///
/// Ordering rules: a worker may take any available tile of the oldest
/// incomplete draw; for younger draws it may only touch tiles it completed
/// itself in prior draws during this pass (recorded in `used`), never
/// crossing a scissor change or an unmet dependency.
pub(crate) fn work_on_fifo_be(shared: &Shared, cursor: &AtomicU64, used: &mut UsedTiles) {
    let enqueued = shared.draw_enqueued.load(Ordering::Acquire);
    let mut cur = cursor.load(Ordering::Relaxed);

    // Advance past draws that fully retired.
    while cur < enqueued {
        let dc = shared.dc(cur);
        if !dc.done_fe.load(Ordering::Acquire) {
            break;
        }
        if dc.tile_mgr.is_work_complete() {
            cur += 1;
        } else {
            break;
        }
    }
    cursor.store(cur, Ordering::Release);
    if cur >= enqueued {
        return;
    }

    let mut last_retired = cur;
    used.clear();
    let mut prev_scissor: Option<Bbox> = None;

    let mut draw = cur;
    while draw < shared.draw_enqueued.load(Ordering::Acquire) {
        let dc = shared.dc(draw);
        if !dc.done_fe.load(Ordering::Acquire) {
            break;
        }
        if dependency_unmet(shared, dc, last_retired) {
            return;
        }
        // A scissor change is a cross-draw barrier: macro-tile geometry may
        // differ, so completion knowledge does not transfer.
        let scissor = dc.state().scissor_in_tiles;
        if let Some(prev) = prev_scissor
            && prev != scissor
        {
            return;
        }

        for &tile_id in dc.tile_mgr.used_tiles() {
            let tile = dc.tile_mgr.tile(tile_id);

            if tile.is_complete() {
                used.insert(tile_id);
                continue;
            }
            // Younger draws: only tiles this worker itself completed in the
            // older draws are ordered-safe.
            if draw != cur && !used.contains(tile_id) {
                continue;
            }

            if tile.fifo.num_queued() > 0 && tile.fifo.try_lock() {
                used.insert(tile_id);

                // A completing worker clears the FIFO and drops the lock; we
                // may have locked the already-cleared queue. Nothing to do
                // then.
                if tile.fifo.num_queued() == 0 {
                    tile.fifo.unlock();
                    continue;
                }

                while let Some(work) = tile.fifo.peek() {
                    (work.func)(dc, tile_id, &work.desc);
                    tile.fifo.dequeue();
                }

                if dc.tile_mgr.mark_tile_complete(tile_id) {
                    // Whole draw just retired.
                    if let Some(callback) = dc.take_on_complete() {
                        callback(dc);
                    }
                    if draw == cur {
                        cur += 1;
                        cursor.store(cur, Ordering::Release);
                        last_retired += 1;
                        used.clear();
                        break;
                    }
                }
            } else {
                // Tile is owned by someone else now; our completion history
                // for it no longer guarantees ordering.
                used.remove(tile_id);
            }
        }
        prev_scissor = Some(scissor);
        draw += 1;
    }
}

fn worker_main(shared: Arc<Shared>, worker_id: usize, core: usize, pin: bool) {
    let span = tracing::debug_span!("worker", worker_id, core);
    let _enter = span.enter();
    if pin {
        bind_thread(core);
    }
    let worker_node = if shared.num_numa_nodes > 1 {
        worker_id as u32 % shared.num_numa_nodes
    } else {
        0
    };

    let mut used = UsedTiles::default();
    let mut backoff = 0u32;
    let be_cursor = &shared.worker_be[worker_id].0;
    let fe_cursor = &shared.worker_fe[worker_id].0;

    while !shared.shutdown.load(Ordering::Acquire) {
        let mut spins = 0;
        while spins < SPIN_LOOP_COUNT
            && be_cursor.load(Ordering::Relaxed) == shared.draw_enqueued.load(Ordering::Acquire)
        {
            std::hint::spin_loop();
            spins += 1;
        }

        if be_cursor.load(Ordering::Relaxed) == shared.draw_enqueued.load(Ordering::Acquire) {
            let guard = shared.wait_lock.lock().expect("worker wait lock");
            if shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            // Re-check under the lock so an enqueue between the spin and
            // the wait cannot be missed.
            if be_cursor.load(Ordering::Relaxed) == shared.draw_enqueued.load(Ordering::Acquire) {
                let _guard = shared
                    .fifos_not_empty
                    .wait(guard)
                    .expect("worker condvar wait");
            }
            if shared.shutdown.load(Ordering::Acquire) {
                break;
            }
        }

        work_on_fifo_be(&shared, be_cursor, &mut used);
        work_on_fifo_fe(&shared, fe_cursor, worker_node, &mut backoff);
    }
    tracing::debug!("worker exiting");
}

/// Spawn the worker pool. The API thread is pinned to core 0; workers take
/// the following cores, optionally skipping hyperthread siblings.
pub(crate) fn create_worker_pool(
    shared: &Arc<Shared>,
    config: &ContextConfig,
    workers: usize,
) -> Vec<JoinHandle<()>> {
    if config.pin_threads {
        bind_thread(0);
    }
    let stride = if config.use_hyperthreads { 1 } else { 2 };
    let mut handles = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let shared = Arc::clone(shared);
        let core = worker_id * stride + WORKER_THREAD_OFFSET;
        let pin = config.pin_threads;
        let handle = std::thread::Builder::new()
            .name(format!("softrast-worker-{worker_id}"))
            .spawn(move || worker_main(shared, worker_id, core, pin))
            .expect("spawn worker thread");
        handles.push(handle);
    }
    tracing::info!(workers, "worker pool started");
    handles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn used_tiles_set_semantics() {
        let mut set = UsedTiles::default();
        set.insert(3);
        set.insert(3);
        set.insert(9);
        assert!(set.contains(3) && set.contains(9));
        set.remove(3);
        assert!(!set.contains(3));
        set.clear();
        assert!(!set.contains(9));
    }

    #[test]
    fn node_count_is_at_least_one() {
        assert!(numa_node_count() >= 1);
    }
}
