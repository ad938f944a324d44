use std::fs::Permissions;
use std::io::ErrorKind;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::IpcStream;

/// Device and inode of a socket file, used to recognise our own binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SocketId {
    dev: u64,
    ino: u64,
}

impl SocketId {
    /// `Ok(None)` if nothing exists at `path`; an error if something other
    /// than a socket does.
    fn lookup(path: &Path) -> std::io::Result<Option<Self>> {
        let metadata = match std::fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        if !metadata.file_type().is_socket() {
            return Err(std::io::Error::new(
                ErrorKind::AlreadyExists,
                "existing path is not a unix socket",
            ));
        }
        Ok(Some(Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }))
    }
}

/// Filesystem-path Unix domain socket.
///
/// The device service binds it; the session side connects to it. A bound
/// socket file is removed again on drop, unless something else replaced it.
pub struct UnixDomainSocket {
    listener: UnixListener,
    path: PathBuf,
    id: SocketId,
}

impl UnixDomainSocket {
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;
    /// `sockaddr_un.sun_path` is 108 bytes on Linux, 104 elsewhere.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Binds at `path`, replacing a stale socket file left by a dead service.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let len = path.as_os_str().len();
        if len >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len,
                max: Self::MAX_PATH_LEN,
            });
        }

        match Self::listen(&path) {
            Ok((listener, id)) => {
                info!(?path, "device service listening");
                Ok(Self { listener, path, id })
            }
            Err(source) => Err(TransportError::Bind { path, source }),
        }
    }

    fn listen(path: &Path) -> std::io::Result<(UnixListener, SocketId)> {
        if SocketId::lookup(path)?.is_some() {
            debug!(?path, "removing stale socket");
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, Permissions::from_mode(Self::DEFAULT_SOCKET_MODE))?;
        let id = SocketId::lookup(path)?
            .ok_or_else(|| std::io::Error::new(ErrorKind::NotFound, "socket vanished after bind"))?;
        Ok((listener, id))
    }

    /// Blocks until a client connects.
    pub fn accept(&self) -> Result<IpcStream> {
        let (stream, _) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(path = ?self.path, "client connected");
        Ok(IpcStream::from_unix(stream))
    }

    pub fn connect(path: impl AsRef<Path>) -> Result<IpcStream> {
        let path = path.as_ref();
        UnixStream::connect(path)
            .map(IpcStream::from_unix)
            .map_err(|source| TransportError::Connect {
                path: path.to_path_buf(),
                source,
            })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UnixDomainSocket {
    fn drop(&mut self) {
        match SocketId::lookup(&self.path) {
            Ok(Some(id)) if id == self.id => {
                debug!(path = ?self.path, "removing socket file");
                let _ = std::fs::remove_file(&self.path);
            }
            _ => debug!(path = ?self.path, "socket path replaced; leaving it alone"),
        }
    }
}
