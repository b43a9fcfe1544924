//! Dispositivo de bloco em memória - útil para testes e mídia scratch.

#![allow(dead_code)]

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use spin::RwLock;

use super::block::{check_io_args, BlockDevice};
use crate::util::{KError, KResult};

pub struct RamDisk {
    name: String,
    label: Option<String>,
    block_size: u32,
    num_blocks: u64,
    data: RwLock<Vec<u8>>,
}

impl RamDisk {
    pub fn new(name: &str, block_size: u32, num_blocks: u64) -> Self {
        Self {
            name: name.into(),
            label: None,
            block_size,
            num_blocks,
            data: RwLock::new(vec![0u8; (block_size as u64 * num_blocks) as usize]),
        }
    }

    pub fn with_label(name: &str, label: &str, block_size: u32, num_blocks: u64) -> Self {
        let mut rd = Self::new(name, block_size, num_blocks);
        rd.label = Some(label.into());
        rd
    }

    /// Preenche o disco inteiro com um byte (ex.: 0xFF para simular flash apagada).
    pub fn fill(&self, byte: u8) {
        self.data.write().fill(byte);
    }
}

impl BlockDevice for RamDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    fn read_blocks(&self, lba: u64, count: u32, out: &mut [u8]) -> KResult<()> {
        check_io_args(self.block_size, count, out.len())?;
        if lba + count as u64 > self.num_blocks {
            return Err(KError::OutOfRange);
        }
        let start = (lba * self.block_size as u64) as usize;
        out.copy_from_slice(&self.data.read()[start..start + out.len()]);
        Ok(())
    }

    fn write_blocks(&self, lba: u64, count: u32, data: &[u8]) -> KResult<()> {
        check_io_args(self.block_size, count, data.len())?;
        if lba + count as u64 > self.num_blocks {
            return Err(KError::OutOfRange);
        }
        let start = (lba * self.block_size as u64) as usize;
        self.data.write()[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}
