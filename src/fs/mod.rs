//! Read-only filesystem seam.
//!
//! The ext-family driver itself belongs to the hosting bootloader; the
//! boot core only needs "mount this block device read-only and hand me
//! file contents by path".

#![allow(dead_code)]

pub mod memfs;

pub use memfs::{MemFs, MemFsDriver};

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::storage::BlockDevice;
use crate::util::KResult;

/// Mounted read-only filesystem.
pub trait Filesystem: Send + Sync {
    /// Lê o conteúdo completo de um arquivo pelo caminho absoluto.
    fn read_file(&self, path: &str) -> KResult<Vec<u8>>;
}

/// Filesystem driver capable of mounting a block device read-only.
pub trait FsDriver: Send + Sync {
    fn mount(&self, dev: Arc<dyn BlockDevice>) -> KResult<Arc<dyn Filesystem>>;
}
