//! SFTP transport built on libssh2 (`ssh2`).
//!
//! libssh2 is blocking, so every call is shipped to tokio's blocking pool.
//! Host keys are accepted without verification.

use crate::config::SshConfig;
use crate::error::RemoteError;
use crate::remote::{Connection, Transport};
use crate::vfs::attr::{Attributes, DirEntry, FileKind, epoch_secs};
use async_trait::async_trait;
use ssh2::{ErrorCode, FileStat, Session, Sftp};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;
use tracing::debug;

// SSH_FX_* status codes meaning the object does not exist
const SFTP_NO_SUCH_FILE: i32 = 2;
const SFTP_NO_SUCH_PATH: i32 = 10;

const COPY_BUF_SIZE: usize = 256 * 1024;

#[derive(Clone, Debug)]
pub enum SftpAuth {
    Key(PathBuf),
    Password(String),
    Agent,
}

#[derive(Clone, Debug)]
pub struct SftpTransport {
    host: String,
    port: u16,
    login: String,
    auth: SftpAuth,
}

impl SftpTransport {
    pub fn new(host: impl Into<String>, port: u16, login: impl Into<String>, auth: SftpAuth) -> Self {
        Self {
            host: host.into(),
            port,
            login: login.into(),
            auth,
        }
    }

    /// Key file wins over password; with neither, ssh-agent is asked.
    pub fn from_config(cfg: &SshConfig) -> Self {
        let auth = match (&cfg.key, &cfg.password) {
            (Some(key), _) => SftpAuth::Key(key.clone()),
            (None, Some(pw)) => SftpAuth::Password(pw.clone()),
            (None, None) => SftpAuth::Agent,
        };
        Self::new(cfg.host.clone(), cfg.port, cfg.login.clone(), auth)
    }

    fn open(&self) -> Result<SftpInner, RemoteError> {
        let addr = format!("{}:{}", self.host, self.port);
        let tcp = TcpStream::connect((self.host.as_str(), self.port))
            .map_err(|e| RemoteError::connection(format!("{addr}: {e}")))?;
        let ssh_err = |e: ssh2::Error| RemoteError::connection(format!("{addr}: {e}"));
        let mut session = Session::new().map_err(ssh_err)?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(ssh_err)?;
        match &self.auth {
            SftpAuth::Key(key) => session.userauth_pubkey_file(&self.login, None, key, None),
            SftpAuth::Password(pw) => session.userauth_password(&self.login, pw),
            SftpAuth::Agent => session.userauth_agent(&self.login),
        }
        .map_err(ssh_err)?;
        let sftp = session.sftp().map_err(ssh_err)?;
        Ok(SftpInner { sftp, session })
    }
}

struct SftpInner {
    // dropped before the session it belongs to
    sftp: Sftp,
    session: Session,
}

pub struct SftpConnection {
    inner: Arc<Mutex<SftpInner>>,
}

#[async_trait]
impl Transport for SftpTransport {
    type Conn = SftpConnection;

    async fn connect(&self) -> Result<Self::Conn, RemoteError> {
        let this = self.clone();
        debug!(host = %this.host, port = this.port, login = %this.login, "sftp connect");
        let inner = tokio::task::spawn_blocking(move || this.open())
            .await
            .map_err(|e| RemoteError::connection(format!("sftp connect task failed: {e}")))??;
        Ok(SftpConnection {
            inner: Arc::new(Mutex::new(inner)),
        })
    }
}

fn classify(err: ssh2::Error, path: &Path) -> RemoteError {
    match err.code() {
        ErrorCode::SFTP(SFTP_NO_SUCH_FILE) | ErrorCode::SFTP(SFTP_NO_SUCH_PATH) => {
            RemoteError::NotFound(path.display().to_string())
        }
        _ => RemoteError::connection(format!("{}: {err}", path.display())),
    }
}

fn stat_to_attr(st: &FileStat) -> Attributes {
    let mode = st.perm.unwrap_or(0);
    Attributes {
        kind: FileKind::from_mode(mode),
        size: st.size.unwrap_or(0),
        atime: st.atime.map_or(UNIX_EPOCH, |t| epoch_secs(t as i64, 0)),
        mtime: st.mtime.map_or(UNIX_EPOCH, |t| epoch_secs(t as i64, 0)),
        uid: st.uid.unwrap_or(0),
        gid: st.gid.unwrap_or(0),
        perm: (mode & 0o7777) as u16,
    }
}

impl SftpConnection {
    async fn blocking<R, F>(&self, f: F) -> Result<R, RemoteError>
    where
        R: Send + 'static,
        F: FnOnce(&SftpInner) -> Result<R, RemoteError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = inner
                .lock()
                .map_err(|_| RemoteError::connection("sftp connection poisoned"))?;
            f(&guard)
        })
        .await
        .map_err(|e| RemoteError::connection(format!("sftp task failed: {e}")))?
    }
}

#[async_trait]
impl Connection for SftpConnection {
    async fn stat(&self, path: &Path) -> Result<Attributes, RemoteError> {
        let path = path.to_path_buf();
        self.blocking(move |c| {
            let st = c.sftp.lstat(&path).map_err(|e| classify(e, &path))?;
            Ok(stat_to_attr(&st))
        })
        .await
    }

    async fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>, RemoteError> {
        let path = path.to_path_buf();
        self.blocking(move |c| {
            let entries = c.sftp.readdir(&path).map_err(|e| classify(e, &path))?;
            Ok(entries
                .into_iter()
                .filter_map(|(p, st)| {
                    let name = p.file_name()?.to_string_lossy().into_owned();
                    let kind = FileKind::from_mode(st.perm.unwrap_or(0));
                    Some(DirEntry::new(name, kind))
                })
                .filter(|e| e.name != "." && e.name != "..")
                .collect())
        })
        .await
    }

    async fn fetch(&self, remote: &Path, dest: &Path) -> Result<(), RemoteError> {
        let remote = remote.to_path_buf();
        let dest = dest.to_path_buf();
        self.blocking(move |c| {
            let mut src = c.sftp.open(&remote).map_err(|e| classify(e, &remote))?;
            let mut out = std::fs::File::create(&dest)?;
            let mut buf = vec![0u8; COPY_BUF_SIZE];
            loop {
                let n = src.read(&mut buf).map_err(|e| {
                    RemoteError::connection(format!("{}: read failed: {e}", remote.display()))
                })?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n])?;
            }
            out.flush()?;
            Ok(())
        })
        .await
    }

    async fn close(&self) -> Result<(), RemoteError> {
        self.blocking(|c| {
            c.session
                .disconnect(None, "unmount", None)
                .map_err(|e| RemoteError::connection(format!("sftp disconnect failed: {e}")))
        })
        .await
    }
}
