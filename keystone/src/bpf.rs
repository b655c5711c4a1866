// src/bpf.rs
use crate::error::{KeystoneError, KeystoneResult};
use libc::{c_void, sock_filter, sock_fprog, socklen_t};
use std::io;
use std::mem;
use std::os::unix::io::RawFd;

// Classic BPF opcode pieces; only what the affinity program needs.
const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_ALU: u16 = 0x04;
const BPF_MOD: u16 = 0x90;
const BPF_K: u16 = 0x00;
const BPF_RET: u16 = 0x06;
const BPF_A: u16 = 0x10;

// Ancillary-data load offsets (linux/filter.h).
const SKF_AD_OFF: i32 = -0x1000;
const SKF_AD_RXHASH: i32 = 32;

/// Kernel limit on classic BPF program length.
pub const BPF_MAXINSNS: usize = 4096;

#[inline]
fn insn(code: u16, k: u32) -> sock_filter {
    sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

/// Program steering each new connection in a REUSEPORT group to the
/// socket at index `rx_hash % workers`. The kernel computes the hash per
/// flow, so every segment of one TCP connection lands on the same worker
/// for the connection's entire lifetime.
pub fn affinity_program(workers: u32) -> KeystoneResult<Vec<sock_filter>> {
    if workers == 0 {
        return Err(KeystoneError::InvalidWorkerCount);
    }

    let prog = if workers == 1 {
        vec![insn(BPF_RET | BPF_K, 0)]
    } else {
        vec![
            insn(BPF_LD | BPF_W | BPF_ABS, (SKF_AD_OFF + SKF_AD_RXHASH) as u32),
            insn(BPF_ALU | BPF_MOD | BPF_K, workers),
            insn(BPF_RET | BPF_A, 0),
        ]
    };

    if prog.len() > BPF_MAXINSNS {
        return Err(KeystoneError::BpfProgramTooLarge(prog.len()));
    }
    Ok(prog)
}

/// Attach the affinity filter to a bound (not yet listening) REUSEPORT
/// socket. Attach failures on old kernels or restricted environments are
/// tolerated by the caller: affinity degrades, correctness does not.
pub fn attach_reuseport_filter(fd: RawFd, workers: u32) -> KeystoneResult<()> {
    let mut prog = affinity_program(workers)?;
    let fprog = sock_fprog {
        len: prog.len() as u16,
        filter: prog.as_mut_ptr(),
    };

    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ATTACH_REUSEPORT_CBPF,
            &fprog as *const _ as *const c_void,
            mem::size_of::<sock_fprog>() as socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}
