//! The `NETLINK_CONNECTOR` socket of the w1 subsystem.

use std::{
    io, mem,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
};
use w1_netlink::NetlinkSocket;

/// Multicast groups joined for w1 announcements.
const W1_GROUPS: u32 = 23;

/// A bound connector socket.
pub struct ConnectorSocket {
    fd: OwnedFd,
    port: u32,
}

fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn size(ret: libc::ssize_t) -> io::Result<usize> {
    usize::try_from(ret).map_err(|_| io::Error::last_os_error())
}

impl ConnectorSocket {
    /// Opens the socket and binds it; the kernel picks the port id.
    pub fn bind() -> io::Result<Self> {
        let raw = check(unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_CONNECTOR,
            )
        })?;
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = W1_GROUPS;
        let mut len = mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;
        check(unsafe {
            libc::bind(
                fd.as_raw_fd(),
                (&addr as *const libc::sockaddr_nl).cast(),
                len,
            )
        })?;
        check(unsafe {
            libc::getsockname(
                fd.as_raw_fd(),
                (&mut addr as *mut libc::sockaddr_nl).cast(),
                &mut len,
            )
        })?;
        log::debug!("w1 netlink socket bound to port {}", addr.nl_pid);
        Ok(Self {
            fd,
            port: addr.nl_pid,
        })
    }
}

impl NetlinkSocket for ConnectorSocket {
    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        size(unsafe { libc::send(self.fd.as_raw_fd(), buf.as_ptr().cast(), buf.len(), 0) })
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        size(unsafe { libc::recv(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), 0) })
    }

    fn port_id(&self) -> u32 {
        self.port
    }
}
