//! Mount helpers for starting/stopping the FUSE session
//!
//! Runs unprivileged through fusermount3 unless the process is root.

use crate::config::MountConfig;
use crate::fuse::FetchFs;
use crate::remote::Transport;
use rfuse3::MountOptions;
use rfuse3::raw::{MountHandle, Session};
use std::path::Path;
use tracing::info;

/// Mount options for a fetchfs session. Files are reported with their real
/// owners, the mount itself belongs to the calling user.
pub fn mount_options(cfg: &MountConfig) -> MountOptions {
    let uid = nix::unistd::getuid().as_raw();
    let gid = nix::unistd::getgid().as_raw();

    let mut mo = MountOptions::default();
    mo.fs_name("fetchfs")
        .uid(uid)
        .gid(gid)
        .force_readdir_plus(true)
        .allow_other(cfg.allow_other)
        .nonempty(cfg.nonempty);
    mo
}

#[cfg(target_os = "linux")]
pub async fn mount_fetchfs<T>(
    fs: FetchFs<T>,
    mount_point: impl AsRef<Path>,
    cfg: &MountConfig,
) -> std::io::Result<MountHandle>
where
    T: Transport + 'static,
{
    let mount_point = mount_point.as_ref();
    let session = Session::new(mount_options(cfg));
    if nix::unistd::geteuid().is_root() {
        info!("mounting fetchfs at {}", mount_point.display());
        session.mount(fs, mount_point).await
    } else {
        info!("mounting fetchfs at {} (unprivileged)", mount_point.display());
        session.mount_with_unprivileged(fs, mount_point).await
    }
}

#[cfg(not(target_os = "linux"))]
pub async fn mount_fetchfs<T>(
    _fs: FetchFs<T>,
    _mount_point: impl AsRef<Path>,
    _cfg: &MountConfig,
) -> std::io::Result<MountHandle>
where
    T: Transport + 'static,
{
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
