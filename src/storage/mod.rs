//! Camada de storage do boot core.
//!
//! O provedor de I/O real (eMMC, partições GPT) vive no bootloader
//! hospedeiro; aqui fica o registro de dispositivos nomeados e o
//! sub-dispositivo lógico usado pelo boot A/B.

#![allow(dead_code)]

pub mod block;
pub mod ramdisk;

pub use block::{check_io_args, BlockDevice, SubDevice};
pub use ramdisk::RamDisk;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::kprintln;
use crate::util::{KError, KResult};

/// Registro de dispositivos de bloco por nome.
pub struct BlockDevs {
    devices: Mutex<Vec<Arc<dyn BlockDevice>>>,
    enumerated: AtomicBool,
}

impl BlockDevs {
    pub const fn new() -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
            enumerated: AtomicBool::new(false),
        }
    }

    /// Runs the provider enumeration exactly once.
    pub fn ensure_enumerated<F: FnOnce(&Self)>(&self, f: F) {
        if !self.enumerated.swap(true, Ordering::AcqRel) {
            f(self);
        }
    }

    pub fn register(&self, dev: Arc<dyn BlockDevice>) -> KResult<()> {
        let mut devices = self.devices.lock();
        if devices.iter().any(|d| d.name() == dev.name()) {
            return Err(KError::AlreadyExists);
        }
        devices.push(dev);
        Ok(())
    }

    pub fn open(&self, name: &str) -> Option<Arc<dyn BlockDevice>> {
        self.devices
            .lock()
            .iter()
            .find(|d| d.name() == name)
            .cloned()
    }

    pub fn by_label(&self, label: &str) -> Option<Arc<dyn BlockDevice>> {
        self.devices
            .lock()
            .iter()
            .find(|d| d.label() == Some(label))
            .cloned()
    }

    pub fn devices(&self) -> Vec<Arc<dyn BlockDevice>> {
        self.devices.lock().clone()
    }

    /// Publica uma janela de blocos do dispositivo pai sob um novo nome.
    pub fn publish_subdevice(
        &self,
        parent: &str,
        name: &str,
        start_block: u64,
        num_blocks: u64,
    ) -> KResult<Arc<dyn BlockDevice>> {
        let parent_dev = self.open(parent).ok_or(KError::NotFound)?;
        let sub: Arc<dyn BlockDevice> =
            Arc::new(SubDevice::new(parent_dev, name, start_block, num_blocks)?);
        match self.register(sub.clone()) {
            Ok(()) => Ok(sub),
            Err(e) => {
                kprintln!("storage: subdevice '{}' already published", name);
                Err(e)
            }
        }
    }
}
