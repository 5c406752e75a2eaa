//! # TCP wrappers over the hooked syscalls
//!
//! `CoTcpListener` and `CoTcpStream` give coroutine code a plain
//! blocking-looking socket API:
//!
//! ```ignore
//! let listener = CoTcpListener::bind(8080)?;
//! loop {
//!     let stream = listener.accept()?;
//!     pool.spawn_on_random_thread(move || handle(stream), true);
//! }
//! ```
//!
//! Every call that can block goes through [`hook`], so inside a pooled
//! coroutine it parks the coroutine; on a main coroutine it falls back
//! to the raw blocking syscall.

use crate::channel::ChannelTable;
use crate::hook;
use crate::last_errno;

use corio_core::cdebug;
use corio_core::error::{NetError, RtResult};

use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;

const LISTEN_BACKLOG: i32 = 4096;

fn sockaddr_from(addr: &SocketAddrV4) -> libc::sockaddr_in {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = addr.port().to_be();
    sa.sin_addr.s_addr = u32::from(*addr.ip()).to_be();
    sa
}

fn sockaddr_to(sa: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr)),
        u16::from_be(sa.sin_port),
    )
}

fn set_tcp_nodelay(fd: RawFd) {
    let opt: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

fn close_and_forget(fd: RawFd) {
    ChannelTable::global().get(fd).unregister();
    unsafe {
        libc::close(fd);
    }
}

/// A TCP listener whose `accept` parks the calling coroutine.
pub struct CoTcpListener {
    fd: RawFd,
}

impl CoTcpListener {
    /// Bind to `port` on all interfaces and start listening. Port 0 asks
    /// the kernel for an ephemeral port.
    pub fn bind(port: u16) -> RtResult<CoTcpListener> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(NetError::Socket(last_errno()).into());
        }

        let opt: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &opt as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                &opt as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
        set_tcp_nodelay(fd);

        let sa = sockaddr_from(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        let ret = unsafe {
            libc::bind(
                fd,
                &sa as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            let errno = last_errno();
            unsafe {
                libc::close(fd);
            }
            return Err(NetError::Bind(errno).into());
        }

        if unsafe { libc::listen(fd, LISTEN_BACKLOG) } != 0 {
            let errno = last_errno();
            unsafe {
                libc::close(fd);
            }
            return Err(NetError::Listen(errno).into());
        }

        cdebug!("listener fd {} bound on port {}", fd, port);
        Ok(CoTcpListener { fd })
    }

    /// Wait for a client. Parks the calling coroutine until one arrives.
    pub fn accept(&self) -> RtResult<CoTcpStream> {
        let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut sa_len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

        let client = unsafe {
            hook::accept(
                self.fd,
                &mut sa as *mut _ as *mut libc::sockaddr,
                &mut sa_len,
            )
        };
        if client < 0 {
            return Err(NetError::Accept(last_errno()).into());
        }

        set_tcp_nodelay(client);
        let peer = sockaddr_to(&sa);
        cdebug!("accepted fd {} from {}", client, peer);
        Ok(CoTcpStream {
            fd: client,
            peer: Some(peer),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for CoTcpListener {
    fn drop(&mut self) {
        close_and_forget(self.fd);
    }
}

/// One TCP connection. Reads and writes park the calling coroutine
/// until the socket is ready.
#[derive(Debug)]
pub struct CoTcpStream {
    fd: RawFd,
    peer: Option<SocketAddrV4>,
}

impl CoTcpStream {
    /// Connect to `ip:port`. Inside a coroutine this honors the
    /// configured connect timeout; failure closes the socket.
    pub fn connect(ip: &str, port: u16) -> RtResult<CoTcpStream> {
        let ip: Ipv4Addr = ip.parse().map_err(|_| NetError::BadAddress)?;
        let peer = SocketAddrV4::new(ip, port);

        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(NetError::Socket(last_errno()).into());
        }
        cdebug!("connecting fd {} to {}", fd, peer);

        let sa = sockaddr_from(&peer);
        let ret = unsafe {
            hook::connect(
                fd,
                &sa as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            let errno = last_errno();
            close_and_forget(fd);
            if errno == libc::ETIMEDOUT {
                return Err(NetError::ConnectTimedOut.into());
            }
            return Err(NetError::Connect(errno).into());
        }

        set_tcp_nodelay(fd);
        Ok(CoTcpStream {
            fd,
            peer: Some(peer),
        })
    }

    /// Read into `buf`. `Ok(0)` means the peer closed.
    pub fn read(&self, buf: &mut [u8]) -> RtResult<usize> {
        let n = hook::read(self.fd, buf);
        if n < 0 {
            return Err(NetError::Read(last_errno()).into());
        }
        Ok(n as usize)
    }

    /// Write once; may be short.
    pub fn write(&self, buf: &[u8]) -> RtResult<usize> {
        let n = hook::write(self.fd, buf);
        if n < 0 {
            return Err(NetError::Write(last_errno()).into());
        }
        Ok(n as usize)
    }

    /// Write the whole buffer, retrying short writes.
    pub fn write_all(&self, mut buf: &[u8]) -> RtResult<()> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            buf = &buf[n..];
        }
        Ok(())
    }

    pub fn peer_addr(&self) -> Option<SocketAddrV4> {
        self.peer
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for CoTcpStream {
    fn drop(&mut self) {
        cdebug!("closing stream fd {}", self.fd);
        close_and_forget(self.fd);
    }
}
