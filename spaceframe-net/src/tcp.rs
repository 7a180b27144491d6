//! TCP socket plumbing.
//!
//! Applies socket options on accepted and connected streams and hands the
//! session a duplicated handle it can shut the socket down with from any
//! thread (to abort a blocked read, or to half-close after the write
//! pump drains).
//!
//! # Safety
//!
//! This module uses unsafe code to access raw file descriptors/sockets
//! for socket configuration. The unsafe operations are encapsulated and
//! safe to use from the public API.

#![allow(unsafe_code)]

use std::io;
use std::net::Shutdown;

use crate::options::SessionOptions;

/// Apply the engine's socket options (TCP_NODELAY, SO_LINGER) to a
/// compio `TcpStream`.
///
/// # Errors
///
/// Returns an error if a socket option cannot be set.
pub fn configure_stream(
    stream: &compio::net::TcpStream,
    options: &SessionOptions,
) -> io::Result<()> {
    with_borrowed_socket(stream, |sock| {
        sock.set_nodelay(options.nodelay)?;
        sock.set_linger(options.linger)?;
        Ok(())
    })
}

/// Duplicate the stream's descriptor into a handle that can shut the
/// underlying socket down independently of where the stream itself lives.
///
/// # Errors
///
/// Returns an error if the descriptor cannot be duplicated.
pub fn shutdown_handle(stream: &compio::net::TcpStream) -> io::Result<ShutdownHandle> {
    let sock = with_borrowed_socket(stream, socket2::Socket::try_clone)?;
    Ok(ShutdownHandle { sock })
}

/// A duplicated descriptor for out-of-band shutdown.
///
/// Shutdown affects the shared underlying socket; dropping the handle
/// only closes the duplicate.
pub struct ShutdownHandle {
    sock: socket2::Socket,
}

impl ShutdownHandle {
    /// Shut down both directions; an in-flight read observes EOF.
    pub fn shutdown_both(&self) -> io::Result<()> {
        self.sock.shutdown(Shutdown::Both)
    }

    /// Half-close: stop sending, keep receiving.
    pub fn shutdown_write(&self) -> io::Result<()> {
        self.sock.shutdown(Shutdown::Write)
    }
}

/// Run `f` with a borrowed `socket2::Socket` view of the stream's
/// descriptor without taking ownership of it.
fn with_borrowed_socket<T>(
    stream: &compio::net::TcpStream,
    f: impl FnOnce(&socket2::Socket) -> io::Result<T>,
) -> io::Result<T> {
    #[cfg(unix)]
    {
        use std::os::unix::io::{AsRawFd, FromRawFd};
        let fd = stream.as_raw_fd();
        let sock = unsafe { socket2::Socket::from_raw_fd(fd) };
        let result = f(&sock);
        std::mem::forget(sock); // Don't close the fd
        result
    }

    #[cfg(windows)]
    {
        use std::os::windows::io::{AsRawSocket, FromRawSocket};
        let raw = stream.as_raw_socket();
        let sock = unsafe { socket2::Socket::from_raw_socket(raw) };
        let result = f(&sock);
        std::mem::forget(sock); // Don't close the socket
        result
    }
}
