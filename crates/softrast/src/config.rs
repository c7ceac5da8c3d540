//! Pipeline knobs and context configuration.

use model::DriverType;

/// Depth of the draw-context ring.
pub const MAX_DRAWS_IN_FLIGHT: usize = 64;

/// Draw calls are split into chunks of at most this many primitives, one
/// draw context per chunk.
pub const MAX_PRIMS_PER_DRAW: u32 = 2048;

/// Busy-wait iterations before a worker blocks on the wake-up condvar.
pub const SPIN_LOOP_COUNT: u32 = 5000;

pub const MIN_WORKER_THREADS: usize = 1;
pub const MAX_WORKER_THREADS: usize = 32;

/// Core id of the first worker; the API thread keeps core 0.
pub const WORKER_THREAD_OFFSET: usize = 1;

/// Frontend claims prefer NUMA-local draws for this many failed scans before
/// a worker takes whatever is available.
pub const FE_BACKOFF_COUNT: u32 = 8;

/// Environment variable overriding the worker count.
pub const WORKER_THREADS_ENV: &str = "SWR_WORKER_THREADS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadingMode {
    /// Frontend and backend run inline on the API thread; no workers, no
    /// synchronization.
    Single,
    /// A pool of pinned worker threads drains the draw ring.
    #[default]
    Pool,
}

#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub driver: DriverType,
    pub threading: ThreadingMode,
    /// Explicit worker count; `None` derives one from the machine and the
    /// `SWR_WORKER_THREADS` environment variable.
    pub worker_threads: Option<usize>,
    /// Use every logical core instead of one worker per physical core.
    pub use_hyperthreads: bool,
    /// Pin workers to cores (Linux only; elsewhere a no-op).
    pub pin_threads: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig {
            driver: DriverType::Dx,
            threading: ThreadingMode::Pool,
            worker_threads: None,
            use_hyperthreads: true,
            pin_threads: true,
        }
    }
}

/// Resolve the number of workers for a pool-mode context.
pub fn resolve_worker_count(config: &ContextConfig) -> usize {
    if let Some(count) = config.worker_threads {
        return count.clamp(MIN_WORKER_THREADS, MAX_WORKER_THREADS);
    }

    let mut hw_threads = std::thread::available_parallelism().map_or(1, |n| n.get());
    if !config.use_hyperthreads {
        hw_threads /= 2;
    }
    let mut count = hw_threads
        .saturating_sub(WORKER_THREAD_OFFSET)
        .clamp(MIN_WORKER_THREADS, MAX_WORKER_THREADS);

    if let Ok(requested) = std::env::var(WORKER_THREADS_ENV) {
        match requested.trim().parse::<usize>() {
            Ok(n) => count = n.max(MIN_WORKER_THREADS),
            Err(_) => {
                tracing::warn!(value = %requested, "{WORKER_THREADS_ENV} could not be parsed");
            }
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_worker_count_is_clamped() {
        let config = ContextConfig {
            worker_threads: Some(4096),
            ..ContextConfig::default()
        };
        assert_eq!(resolve_worker_count(&config), MAX_WORKER_THREADS);

        let config = ContextConfig {
            worker_threads: Some(0),
            ..ContextConfig::default()
        };
        assert_eq!(resolve_worker_count(&config), MIN_WORKER_THREADS);
    }
}
