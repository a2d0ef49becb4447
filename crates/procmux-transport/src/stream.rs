use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use tracing::debug;

use crate::error::{Result, TransportError};

/// One end of the launcher connection.
///
/// procmux speaks its packet protocol over exactly one of these per
/// launcher. The I/O threads each hold their own clone of the connection,
/// and [`shutdown`](LocalStream::shutdown) on any clone tears it out from
/// under all of them; that is how the launcher interrupts a read loop that
/// is parked on a quiet helper.
#[derive(Debug)]
pub struct LocalStream(UnixStream);

/// What the kernel reports about the process on the other end.
///
/// The launcher only trusts a helper that runs as the same user as the
/// host; the pid is kept so connection logs can name the helper process.
#[derive(Debug, Clone, Copy)]
pub struct PeerIdentity {
    pub uid: u32,
    pub pid: u32,
}

impl LocalStream {
    pub(crate) fn new(inner: UnixStream) -> Self {
        Self(inner)
    }

    /// Connect to a listening launcher socket (blocking).
    ///
    /// This is the helper's half of the handshake; the test suite uses it
    /// to stand in for the helper binary.
    pub fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match UnixStream::connect(path) {
            Ok(inner) => {
                debug!(?path, "connected to launcher socket");
                Ok(Self(inner))
            }
            Err(source) => Err(TransportError::Connect {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// A connected host/helper pair over an anonymous socketpair.
    ///
    /// Lets a test (or an in-process toy helper) skip the listener and
    /// attach one end straight to a launcher.
    pub fn pair() -> Result<(Self, Self)> {
        let (host, helper) = UnixStream::pair()?;
        Ok((Self(host), Self(helper)))
    }

    /// Another handle to the same connection.
    ///
    /// The launcher takes one clone per role: the read loop, the writer
    /// thread, and a control handle it only ever uses to shut the socket
    /// down.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self(self.0.try_clone()?))
    }

    /// Close both directions of the connection, on every clone at once.
    pub fn shutdown(&self) -> Result<()> {
        self.0.shutdown(std::net::Shutdown::Both)?;
        Ok(())
    }

    /// Switch the stream between blocking and nonblocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.0.set_nonblocking(nonblocking)?;
        Ok(())
    }

    /// Bound the time a read may sit on a quiet connection.
    pub fn set_read_timeout(&self, timeout: Option<std::time::Duration>) -> Result<()> {
        self.0.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Ask the kernel who is on the other end.
    ///
    /// Returns `None` where the platform has no `SO_PEERCRED` equivalent;
    /// the listener then admits the helper without an identity check.
    #[cfg(target_os = "linux")]
    pub fn helper_identity(&self) -> Option<PeerIdentity> {
        use std::mem::MaybeUninit;
        use std::os::fd::AsRawFd;

        let mut cred = MaybeUninit::<libc::ucred>::uninit();
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
        // SAFETY: the fd is a live socket owned by this stream, and the
        // kernel writes at most `len` bytes into `cred`.
        let rc = unsafe {
            libc::getsockopt(
                self.0.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                cred.as_mut_ptr().cast(),
                &mut len,
            )
        };
        if rc != 0 {
            return None;
        }
        // SAFETY: getsockopt reported success, so `cred` is initialized.
        let cred = unsafe { cred.assume_init() };
        Some(PeerIdentity {
            uid: cred.uid,
            pid: cred.pid as u32,
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn helper_identity(&self) -> Option<PeerIdentity> {
        None
    }
}

impl Read for LocalStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for LocalStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}
