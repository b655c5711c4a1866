// src/slab.rs
use crate::conn::{Conn, ConnState};

/// Fixed pool of connection objects, allocated once at worker startup.
/// Free slots form an intrusive list threaded through the `fd` field, so
/// allocate and free are O(1) with no side table. Entries never move:
/// kernel operations hold pointers into their buffers.
pub struct ConnSlab {
    entries: Box<[Conn]>,
    free_head: i32,
    active: usize,
}

impl ConnSlab {
    pub fn new(capacity: usize) -> Self {
        let mut entries = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let mut conn = Conn::new();
            // fd doubles as the next-free link; the last slot ends the list.
            conn.fd = if i == capacity - 1 { -1 } else { (i + 1) as i32 };
            entries.push(conn);
        }

        Self {
            entries: entries.into_boxed_slice(),
            free_head: if capacity == 0 { -1 } else { 0 },
            active: 0,
        }
    }

    /// Claim a slot for `fd`. None when the pool is exhausted.
    #[inline]
    pub fn allocate(&mut self, fd: i32) -> Option<usize> {
        if self.free_head < 0 {
            return None;
        }
        let idx = self.free_head as usize;
        let conn = &mut self.entries[idx];
        self.free_head = conn.fd;
        conn.open(fd);
        self.active += 1;
        Some(idx)
    }

    /// Return a slot to the free list. Double frees are ignored.
    #[inline]
    pub fn free(&mut self, idx: usize) {
        if idx >= self.entries.len() {
            return;
        }
        let conn = &mut self.entries[idx];
        if conn.state == ConnState::Free {
            return;
        }
        conn.fd = self.free_head;
        conn.state = ConnState::Free;
        self.free_head = idx as i32;
        self.active -= 1;
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Conn> {
        self.entries.get(idx)
    }

    #[inline]
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Conn> {
        self.entries.get_mut(idx)
    }

    #[inline]
    pub fn active(&self) -> usize {
        self.active
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
}
