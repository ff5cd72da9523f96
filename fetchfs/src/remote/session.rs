use crate::error::RemoteError;
use crate::remote::{Connection, Transport};
use crate::vfs::attr::{Attributes, DirEntry};
use std::path::Path;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{info, warn};

enum SessionState<C> {
    Idle,
    Open(C),
    Closed,
}

/// Owns the single connection of a mount. The connection is set up on first
/// use, shared by every later call and torn down once by [`close`].
///
/// Every remote call runs while holding the session lock, so the underlying
/// connection only ever sees one request at a time.
///
/// [`close`]: RemoteSession::close
pub struct RemoteSession<T: Transport> {
    transport: T,
    state: Mutex<SessionState<T::Conn>>,
}

impl<T: Transport> RemoteSession<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            state: Mutex::new(SessionState::Idle),
        }
    }

    /// Lock the session, connecting first if this is the first remote access.
    /// The returned guard keeps every other remote call waiting until dropped.
    pub async fn get(&self) -> Result<MappedMutexGuard<'_, T::Conn>, RemoteError> {
        let mut state = self.state.lock().await;
        if matches!(*state, SessionState::Closed) {
            return Err(RemoteError::connection("remote session is closed"));
        }
        if matches!(*state, SessionState::Idle) {
            let conn = self.transport.connect().await.inspect_err(|e| {
                warn!("remote connect failed: {e}");
            })?;
            info!("remote session established");
            *state = SessionState::Open(conn);
        }
        MutexGuard::try_map(state, |s| match s {
            SessionState::Open(conn) => Some(conn),
            _ => None,
        })
        .map_err(|_| RemoteError::connection("remote session is not open"))
    }

    pub async fn is_open(&self) -> bool {
        matches!(&*self.state.lock().await, SessionState::Open(_))
    }

    pub async fn stat(&self, path: &Path) -> Result<Attributes, RemoteError> {
        self.get().await?.stat(path).await
    }

    pub async fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>, RemoteError> {
        self.get().await?.list_dir(path).await
    }

    pub async fn fetch(&self, remote: &Path, dest: &Path) -> Result<(), RemoteError> {
        self.get().await?.fetch(remote, dest).await
    }

    /// Tear the connection down. Only the first call has an effect; the
    /// session refuses any further remote work afterwards.
    pub async fn close(&self) -> Result<(), RemoteError> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, SessionState::Closed) {
            SessionState::Open(conn) => {
                info!("closing remote session");
                conn.close().await
            }
            SessionState::Idle | SessionState::Closed => Ok(()),
        }
    }
}
