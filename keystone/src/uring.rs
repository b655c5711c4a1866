// src/uring.rs
use crate::error::{KeystoneError, KeystoneResult};
use io_uring::{opcode, squeue, types, IoUring};
use std::ptr;

pub const OP_ACCEPT: u64 = 0;
pub const OP_RECV: u64 = 1;
pub const OP_SEND: u64 = 2;

/// Completion tokens carry the operation kind in the high half and the
/// connection slot in the low half.
#[inline]
pub fn token(op: u64, idx: usize) -> u64 {
    (op << 32) | idx as u64
}

#[inline]
pub fn token_op(token: u64) -> u64 {
    token >> 32
}

#[inline]
pub fn token_idx(token: u64) -> usize {
    (token & 0xFFFF_FFFF) as usize
}

#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub user_data: u64,
    pub result: i32,
}

/// Thin proactor wrapper: submit accept/recv/send, collect completions.
/// Buffers handed to `submit_recv`/`submit_send` must keep their address
/// until the matching completion is delivered; callers pass slices into
/// slab-owned storage that never moves.
pub struct EventLoop {
    ring: IoUring,
}

impl EventLoop {
    pub fn new(entries: u32) -> KeystoneResult<Self> {
        Ok(Self {
            ring: IoUring::new(entries)?,
        })
    }

    fn push(&mut self, entry: squeue::Entry) -> KeystoneResult<()> {
        unsafe {
            if self.ring.submission().push(&entry).is_err() {
                // Queue full: flush what we have and retry once.
                self.ring.submit()?;
                self.ring
                    .submission()
                    .push(&entry)
                    .map_err(|_| KeystoneError::Other("submission queue overflow".into()))?;
            }
        }
        Ok(())
    }

    pub fn submit_accept(&mut self, listen_fd: i32, user_data: u64) -> KeystoneResult<()> {
        let entry = opcode::Accept::new(types::Fd(listen_fd), ptr::null_mut(), ptr::null_mut())
            .build()
            .user_data(user_data);
        self.push(entry)
    }

    pub fn submit_recv(&mut self, fd: i32, buf: &mut [u8], user_data: u64) -> KeystoneResult<()> {
        let entry = opcode::Recv::new(types::Fd(fd), buf.as_mut_ptr(), buf.len() as u32)
            .build()
            .user_data(user_data);
        self.push(entry)
    }

    pub fn submit_send(&mut self, fd: i32, buf: &[u8], user_data: u64) -> KeystoneResult<()> {
        let entry = opcode::Send::new(types::Fd(fd), buf.as_ptr(), buf.len() as u32)
            .build()
            .user_data(user_data);
        self.push(entry)
    }

    /// Flush pending submissions, block for at least one completion and
    /// drain everything available into `out`. A signal wakeup returns an
    /// empty batch.
    pub fn wait(&mut self, out: &mut Vec<Completion>) -> KeystoneResult<()> {
        out.clear();
        match self.ring.submit_and_wait(1) {
            Ok(_) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        for cqe in self.ring.completion() {
            out.push(Completion {
                user_data: cqe.user_data(),
                result: cqe.result(),
            });
        }
        Ok(())
    }
}
