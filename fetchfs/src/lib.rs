// Library crate for fetchfs: the overlay engine plus the collaborators the
// binaries wire together (remote transports, FUSE bridge, configuration).

pub mod config;
pub mod error;
pub mod fuse;
pub mod remote;
pub mod vfs;

pub use config::{Config, load_config};
pub use error::{FsError, RemoteError};
pub use vfs::fs::OverlayFs;
