//! Wall-clock and peak-memory measurement around a single execution.
//!
//! Peak memory comes from [`TracingAllocator`], a pass-through global allocator
//! that only counts while a measurement window is open. The binary hosting the
//! engine installs it with `#[global_allocator]`; when it is not installed the
//! measurement reports `None`.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::time::Instant;

static INSTALLED: AtomicBool = AtomicBool::new(false);
static TRACING: AtomicBool = AtomicBool::new(false);
static CURRENT: AtomicIsize = AtomicIsize::new(0);
static PEAK: AtomicIsize = AtomicIsize::new(0);

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// System allocator wrapper recording net bytes allocated inside a window.
pub struct TracingAllocator;

impl TracingAllocator {
    fn record_alloc(size: usize) {
        if !INSTALLED.load(Ordering::Relaxed) {
            INSTALLED.store(true, Ordering::Relaxed);
        }
        if TRACING.load(Ordering::Relaxed) {
            let size = size as isize;
            let now = CURRENT.fetch_add(size, Ordering::Relaxed) + size;
            PEAK.fetch_max(now, Ordering::Relaxed);
        }
    }

    fn record_free(size: usize) {
        if TRACING.load(Ordering::Relaxed) {
            CURRENT.fetch_sub(size as isize, Ordering::Relaxed);
        }
    }
}

unsafe impl GlobalAlloc for TracingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            Self::record_alloc(layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if !ptr.is_null() {
            Self::record_alloc(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        Self::record_free(layout.size());
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = System.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            Self::record_free(layout.size());
            Self::record_alloc(new_size);
        }
        new_ptr
    }
}

fn start_tracing() {
    CURRENT.store(0, Ordering::Relaxed);
    PEAK.store(0, Ordering::Relaxed);
    TRACING.store(true, Ordering::SeqCst);
}

/// Closes the window and returns the peak in bytes, if the allocator is live.
fn stop_tracing() -> Option<usize> {
    TRACING.store(false, Ordering::SeqCst);
    if !INSTALLED.load(Ordering::Relaxed) {
        return None;
    }
    Some(PEAK.load(Ordering::Relaxed).max(0) as usize)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    pub execution_time: f64,
    pub memory_peak_mb: Option<f64>,
}

/// An open measurement window.
///
/// Dropping the meter without calling [`ResourceMeter::finish`] still closes
/// the allocation window, so an unwinding execution never leaves tracing on.
pub struct ResourceMeter {
    started: Instant,
    open: bool,
}

impl ResourceMeter {
    pub fn start() -> Self {
        start_tracing();
        Self {
            started: Instant::now(),
            open: true,
        }
    }

    pub fn finish(mut self) -> ResourceUsage {
        let elapsed = self.started.elapsed();
        let peak = stop_tracing();
        self.open = false;
        ResourceUsage {
            execution_time: elapsed.as_secs_f64(),
            memory_peak_mb: peak.map(|bytes| bytes as f64 / BYTES_PER_MB),
        }
    }
}

impl Drop for ResourceMeter {
    fn drop(&mut self) {
        if self.open {
            stop_tracing();
        }
    }
}
