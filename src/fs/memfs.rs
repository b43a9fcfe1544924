//! Filesystem em memória (somente leitura depois de montado).
//!
//! Serve de dublê para o driver ext real: um mapa caminho -> conteúdo,
//! montável por nome de dispositivo.

#![allow(dead_code)]

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::{Filesystem, FsDriver};
use crate::storage::BlockDevice;
use crate::util::{KError, KResult};

pub struct MemFs {
    files: BTreeMap<String, Vec<u8>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self {
            files: BTreeMap::new(),
        }
    }

    pub fn insert(mut self, path: &str, data: &[u8]) -> Self {
        self.files.insert(normalize(path), data.into());
        self
    }
}

fn normalize(path: &str) -> String {
    let mut out = String::from("/");
    out.push_str(path.trim_start_matches('/'));
    out
}

impl Filesystem for MemFs {
    fn read_file(&self, path: &str) -> KResult<Vec<u8>> {
        self.files
            .get(&normalize(path))
            .cloned()
            .ok_or(KError::NotFound)
    }
}

/// Driver que "monta" imagens pré-registradas por nome de dispositivo.
pub struct MemFsDriver {
    images: Mutex<BTreeMap<String, Arc<MemFs>>>,
}

impl MemFsDriver {
    pub fn new() -> Self {
        Self {
            images: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn add_image(&self, device_name: &str, fs: MemFs) {
        self.images
            .lock()
            .insert(device_name.into(), Arc::new(fs));
    }
}

impl FsDriver for MemFsDriver {
    fn mount(&self, dev: Arc<dyn BlockDevice>) -> KResult<Arc<dyn Filesystem>> {
        let images = self.images.lock();
        let fs = images.get(dev.name()).ok_or(KError::NotFound)?.clone();
        Ok(fs)
    }
}
