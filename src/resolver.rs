use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::PathBuf;

use tracing::debug;

use crate::error::{Error, Result};

/* ============================= CONSTANTS ============================= */

/// Host procfs as mounted into the operator pod.
pub const PROC_ROOT: &str = "/host/proc";

/// Procfs of the real host on nodes that are themselves containers
/// (kind-style clusters). Checked first during alert enrichment.
pub const REAL_PROC_ROOT: &str = "/host/real/proc";

/* ============================= RESOLUTION ============================= */

/// A file resolved inside a container's mount view. The device is the
/// user-space packed `st_dev`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedInode {
    pub inode: u64,
    pub dev: u64,
}

/// Resolve `path` as seen by the process `pid`, entering its mount view
/// through the host procfs.
pub fn resolve_inode(pid: u32, path: &str, create: bool, mode: u32) -> Result<ResolvedInode> {
    resolve_inode_with_root(PROC_ROOT, pid, path, create, mode)
}

/// Root-parameterised variant, also used by tests and enrichment.
pub fn resolve_inode_with_root(
    proc_root: &str,
    pid: u32,
    path: &str,
    create: bool,
    mode: u32,
) -> Result<ResolvedInode> {
    let target = cross_namespace_path(proc_root, pid, path);

    if create {
        // Create-exclusive: an already-existing file is left untouched.
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&target)
        {
            Ok(_) => debug!(target = %target.display(), mode, "trap_file_created"),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(classify(e)),
        }
    }

    let meta = std::fs::metadata(&target).map_err(classify)?;
    Ok(ResolvedInode {
        inode: meta.ino(),
        dev: meta.dev(),
    })
}

/// `<proc_root>/<pid>/root/<path>` with `path` absolute inside the container.
pub fn cross_namespace_path(proc_root: &str, pid: u32, path: &str) -> PathBuf {
    let relative = path.strip_prefix('/').unwrap_or(path);
    PathBuf::from(proc_root)
        .join(pid.to_string())
        .join("root")
        .join(relative)
}

fn classify(e: std::io::Error) -> Error {
    match e.kind() {
        ErrorKind::NotFound => Error::NotFound,
        ErrorKind::PermissionDenied => Error::Permission,
        _ => Error::Io(e),
    }
}

/* ============================= TESTS ============================= */
