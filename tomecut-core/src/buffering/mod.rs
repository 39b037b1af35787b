//! Reusable sample buffers for graph drives.
//!
//! A full-length audiobook scan moves hours of PCM through the graph in
//! small windows. Renting scratch buffers from a pool keeps the drive
//! loop allocation-free after warm-up.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

/// How many returned buffers the pool keeps before letting extras drop.
const MAX_POOLED: usize = 8;

struct PoolShared {
    free: Mutex<Vec<Vec<f32>>>,
    buffer_len: usize,
}

/// Fixed-length `Vec<f32>` pool. Cloning is cheap and shares the free list.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Create a pool whose buffers all hold `buffer_len` interleaved samples.
    pub fn new(buffer_len: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(Vec::new()),
                buffer_len,
            }),
        }
    }

    pub fn buffer_len(&self) -> usize {
        self.shared.buffer_len
    }

    /// Take a zeroed buffer from the pool, allocating if the free list is empty.
    pub fn rent(&self) -> PooledBuffer {
        let data = {
            let mut free = self.shared.free.lock();
            free.pop()
        };
        let mut data = data.unwrap_or_else(|| vec![0.0; self.shared.buffer_len]);
        data.fill(0.0);
        PooledBuffer {
            data,
            home: Arc::clone(&self.shared),
        }
    }

    #[cfg(test)]
    fn pooled_count(&self) -> usize {
        self.shared.free.lock().len()
    }
}

/// A rented buffer. Returns itself to the pool on drop.
pub struct PooledBuffer {
    data: Vec<f32>,
    home: Arc<PoolShared>,
}

impl Deref for PooledBuffer {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut free = self.home.free.lock();
        if free.len() < MAX_POOLED {
            free.push(std::mem::take(&mut self.data));
        }
    }
}
