//! VFS layer (the overlay engine)
//!
//! Responsibilities:
//! - Map virtual paths onto the local cache root and the remote root.
//! - Resolve attributes and listings with local-over-remote precedence.
//! - Fill the cache on demand, once per path, and confine every mutation to
//!   the local cache.
//!
//! Submodules:
//! - `path`: virtual path normalization and root mapping
//! - `attr`: the fixed attribute set and listing entries
//! - `cache`: single-flight fetch-on-demand
//! - `fs`: the path-based operations the FUSE bridge calls
pub mod attr;
pub mod cache;
pub mod fs;
pub mod path;
