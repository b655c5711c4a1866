// src/syscalls.rs
use crate::error::KeystoneResult;
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::os::unix::io::RawFd;

/// Create a non-blocking TCP socket with SO_REUSEADDR and SO_REUSEPORT
/// and bind it. Listening is deliberately a separate step: the affinity
/// filter must be attached to the REUSEPORT group between bind and
/// listen, before the kernel starts balancing connections.
pub fn create_bound_socket(host: &str, port: u16) -> KeystoneResult<RawFd> {
    let addr: std::net::SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let domain = match addr {
        std::net::SocketAddr::V4(_) => libc::AF_INET,
        std::net::SocketAddr::V6(_) => libc::AF_INET6,
    };

    unsafe {
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let one: c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        if let Err(e) = bind_addr(fd, &addr) {
            libc::close(fd);
            return Err(e);
        }

        Ok(fd)
    }
}

fn bind_addr(fd: c_int, addr: &std::net::SocketAddr) -> KeystoneResult<()> {
    unsafe {
        let rc = match addr {
            std::net::SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                )
            }
            std::net::SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                )
            }
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

pub fn listen(fd: RawFd, backlog: i32) -> KeystoneResult<()> {
    unsafe {
        if libc::listen(fd, backlog) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Set once per accepted socket.
pub fn set_nodelay(fd: RawFd) -> KeystoneResult<()> {
    let one: c_int = 1;
    unsafe {
        if libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}
