//! Per-worker transfer buffer sizing.

use once_cell::sync::OnceCell;

const KB: usize = 1024;
const MB: usize = 1024 * KB;

pub struct BufferSizer {
    default_buffer_size: usize,
    min_buffer_size: usize,
    cached_available_memory: OnceCell<u64>,
}

impl BufferSizer {
    pub fn new() -> Self {
        BufferSizer {
            default_buffer_size: MB,
            min_buffer_size: 8 * KB,
            cached_available_memory: OnceCell::new(),
        }
    }

    /// Get available memory using sysinfo
    fn get_available_memory() -> u64 {
        use sysinfo::System;
        let mut sys = System::new();
        sys.refresh_memory();
        let avail_bytes = sys.available_memory();
        if avail_bytes == 0 {
            // Modem targets can be tight on RAM; assume little.
            256_u64 * 1024 * 1024
        } else {
            avail_bytes
        }
    }

    /// Size of the buffer each of `workers` threads allocates.
    ///
    /// The configured size wins when given; either way the total across all
    /// workers stays under 1% of available memory.
    pub fn worker_buffer_size(&self, configured: Option<usize>, workers: usize) -> usize {
        let available_memory = *self
            .cached_available_memory
            .get_or_init(Self::get_available_memory);

        let wanted = configured.unwrap_or(self.default_buffer_size);
        let per_worker_cap = (available_memory / 100) as usize / workers.max(1);
        wanted.min(per_worker_cap).max(self.min_buffer_size)
    }
}

impl Default for BufferSizer {
    fn default() -> Self {
        Self::new()
    }
}
