use std::io::ErrorKind;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::stream::LocalStream;

/// Only the owning user may reach the launcher socket.
const HELPER_SOCKET_MODE: u32 = 0o600;

/// Portable floor for `sockaddr_un.sun_path` (Linux allows 108).
const MAX_SOCKET_PATH: usize = 104;

/// Identity of a filesystem entry, for telling "our socket file" apart
/// from whatever may have been put at the same path since.
#[derive(Clone, Copy, PartialEq, Eq)]
struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    fn of(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::symlink_metadata(path)?;
        Ok(Self {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }
}

/// The rendezvous point for the helper process.
///
/// A launcher accepts exactly one helper over its lifetime, and it must
/// keep watching for shutdown while nobody has connected yet, so the
/// listener is nonblocking from the start and consumed by polling:
/// [`poll_helper`](Self::poll_helper) either hands over the (verified)
/// helper connection or reports that there is nothing to accept yet.
///
/// The socket file is created private to the user and removed again on
/// drop unless something else has taken over the path in the meantime.
pub struct LocalListener {
    listener: UnixListener,
    path: PathBuf,
    bound_as: FileId,
}

impl LocalListener {
    /// Claim `path` for the launcher rendezvous.
    ///
    /// A leftover socket file from a crashed host is swept aside; any
    /// other kind of file at the path is somebody else's and refused.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let len = path.as_os_str().len();
        if len >= MAX_SOCKET_PATH {
            return Err(TransportError::PathTooLong {
                path,
                len,
                max: MAX_SOCKET_PATH,
            });
        }

        let bind_err = |source: std::io::Error| TransportError::Bind {
            path: path.clone(),
            source,
        };

        match std::fs::symlink_metadata(&path) {
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(bind_err(err)),
            Ok(meta) if meta.file_type().is_socket() => {
                warn!(?path, "sweeping aside leftover launcher socket");
                std::fs::remove_file(&path).map_err(bind_err)?;
            }
            Ok(_) => {
                return Err(bind_err(std::io::Error::new(
                    ErrorKind::AlreadyExists,
                    "path is occupied by something that is not a launcher socket",
                )));
            }
        }

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(HELPER_SOCKET_MODE))
            .map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        let bound_as = FileId::of(&path).map_err(bind_err)?;

        info!(?path, "waiting for launcher helper");
        Ok(Self {
            listener,
            path,
            bound_as,
        })
    }

    /// Check once whether the helper has connected.
    ///
    /// `Ok(None)` means nobody is there yet; poll again after looking for
    /// shutdown. A connecting peer that does not run as the host's user is
    /// refused with `PeerMismatch` and the wait goes on. The accepted
    /// stream is switched back to blocking mode for the I/O threads.
    pub fn poll_helper(&self) -> Result<Option<LocalStream>> {
        let inner = match self.listener.accept() {
            Ok((inner, _addr)) => inner,
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(err) => return Err(TransportError::Accept(err)),
        };

        let stream = LocalStream::new(inner);
        stream.set_nonblocking(false)?;
        if let Some(identity) = stream.helper_identity() {
            // SAFETY: getuid has no preconditions.
            let host_uid = unsafe { libc::getuid() };
            if identity.uid != host_uid {
                return Err(TransportError::PeerMismatch {
                    peer_uid: identity.uid,
                    host_uid,
                });
            }
            debug!(helper_pid = identity.pid, "helper connected");
        } else {
            debug!("helper connected (no peer identity on this platform)");
        }
        Ok(Some(stream))
    }

    /// The path the helper must connect to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        let still_ours = FileId::of(&self.path).map(|current| current == self.bound_as);
        match still_ours {
            Ok(true) => {
                debug!(path = ?self.path, "removing launcher socket file");
                let _ = std::fs::remove_file(&self.path);
            }
            Ok(false) => {
                debug!(path = ?self.path, "socket path was replaced; leaving it");
            }
            Err(_) => {}
        }
    }
}
