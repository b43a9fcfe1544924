//! USB Mass Storage gadget (Bulk-Only Transport).
//!
//! Exposes one named partition as a single LUN over CBW/CSW framing
//! with a minimal SCSI command set. The main loop runs on a dedicated
//! cooperative thread; completion callbacks only record the observed
//! length and signal an auto-reset event, so exactly one transfer is
//! in flight per endpoint.

#![allow(dead_code)]

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use super::dma::{align_up, AlignedBuf, DmaBuffer, DmaOps, Scratch, CACHE_LINE};
use super::{
    EpDir, Udc, UdcDeviceDesc, UdcEndpoint, UdcEvent, UdcGadget, UdcRequest, REQ_STATUS_OK,
};
use crate::console::Console;
use crate::kprintln;
use crate::platform::Platform;
use crate::storage::{BlockDevice, BlockDevs};
use crate::sync::Event;
use crate::util::{KError, KResult};

/* USB Mass Storage class / Bulk-Only Transport */
pub const UMS_CLASS: u8 = 0x08;
pub const UMS_SUBCLASS: u8 = 0x06; // SCSI transparent command set
pub const UMS_PROTOCOL: u8 = 0x50; // Bulk-Only Transport

pub const CBW_SIGNATURE: u32 = 0x4342_5355; // "USBC"
pub const CSW_SIGNATURE: u32 = 0x5342_5355; // "USBS"

pub const CBW_FLAG_DATA_IN: u8 = 0x80;

pub const CSW_STATUS_GOOD: u8 = 0;
pub const CSW_STATUS_FAILED: u8 = 1;
pub const CSW_STATUS_PHASE_ERROR: u8 = 2;

/// SCSI opcodes, sense keys and additional sense codes.
pub mod scsi {
    pub const TEST_UNIT_READY: u8 = 0x00;
    pub const REQUEST_SENSE: u8 = 0x03;
    pub const INQUIRY: u8 = 0x12;
    pub const MODE_SENSE_6: u8 = 0x1A;
    pub const START_STOP_UNIT: u8 = 0x1B;
    pub const PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1E;
    pub const READ_FORMAT_CAPACITIES: u8 = 0x23;
    pub const READ_CAPACITY_10: u8 = 0x25;
    pub const READ_10: u8 = 0x28;
    pub const WRITE_10: u8 = 0x2A;
    pub const VERIFY_10: u8 = 0x2F;

    pub const SENSE_NO_SENSE: u8 = 0x00;
    pub const SENSE_NOT_READY: u8 = 0x02;
    pub const SENSE_MEDIUM_ERROR: u8 = 0x03;
    pub const SENSE_ILLEGAL_REQUEST: u8 = 0x05;

    pub const ASC_INVALID_COMMAND: u8 = 0x20;
    pub const ASC_INVALID_FIELD_IN_CDB: u8 = 0x24;
    pub const ASC_WRITE_PROTECTED: u8 = 0x27;
    pub const ASC_MEDIUM_NOT_PRESENT: u8 = 0x3A;
}

const UMS_DEVICE_DESC: UdcDeviceDesc = UdcDeviceDesc {
    vendor_id: 0x1d6b,  // Linux Foundation
    product_id: 0x0104, // Multifunction Composite Gadget
    version_id: 0x0100,
    manufacturer: "abboot",
    product: "Mass Storage",
};

const INQUIRY_VENDOR: &[u8; 8] = b"abboot  ";
const INQUIRY_PRODUCT: &[u8; 16] = b"Mass Storage    ";
const INQUIRY_REVISION: &[u8; 4] = b"1.0 ";

/// Storage block granularity the transfer buffer is aligned to.
const STORAGE_BLOCK_SIZE: u32 = 512;

/// Partition open retries while the block layer finishes publishing.
const MOUNT_RETRIES: u32 = 30;
const MOUNT_RETRY_MS: u64 = 100;

/// Delay after ONLINE before the first CBW, so enumeration and
/// SET_CONFIGURATION can finish.
const ONLINE_SETTLE_MS: u64 = 500;

/// Command Block Wrapper - 31 bytes, little-endian.
#[derive(Debug, Clone, Copy)]
pub struct Cbw {
    pub tag: u32,
    pub data_transfer_length: u32,
    pub flags: u8,
    pub lun: u8,
    pub cb_length: u8,
    pub cb: [u8; 16],
}

impl Cbw {
    pub const SIZE: usize = 31;

    pub fn new(tag: u32, data_length: u32, flags: u8, lun: u8, command: &[u8]) -> Self {
        let mut cb = [0u8; 16];
        let len = command.len().min(16);
        cb[..len].copy_from_slice(&command[..len]);
        Self {
            tag,
            data_transfer_length: data_length,
            flags,
            lun,
            cb_length: len as u8,
            cb,
        }
    }

    /// Parses a received wrapper. `None` unless the length is exactly
    /// 31 bytes and the signature matches.
    pub fn from_bytes(bytes: &[u8]) -> Option<Cbw> {
        if bytes.len() != Self::SIZE {
            return None;
        }
        let signature = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if signature != CBW_SIGNATURE {
            return None;
        }
        let mut cb = [0u8; 16];
        cb.copy_from_slice(&bytes[15..31]);
        Some(Cbw {
            tag: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            data_transfer_length: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            flags: bytes[12],
            lun: bytes[13],
            cb_length: bytes[14],
            cb,
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&CBW_SIGNATURE.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.tag.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.data_transfer_length.to_le_bytes());
        bytes[12] = self.flags;
        bytes[13] = self.lun;
        bytes[14] = self.cb_length;
        bytes[15..31].copy_from_slice(&self.cb);
        bytes
    }
}

/// Command Status Wrapper - 13 bytes, little-endian.
#[derive(Debug, Clone, Copy)]
pub struct Csw {
    pub tag: u32,
    pub data_residue: u32,
    pub status: u8,
}

impl Csw {
    pub const SIZE: usize = 13;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.tag.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.data_residue.to_le_bytes());
        bytes[12] = self.status;
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Option<Csw> {
        let signature = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if signature != CSW_SIGNATURE {
            return None;
        }
        Some(Csw {
            tag: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            data_residue: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            status: bytes[12],
        })
    }
}

/// Single active instance latch for the whole process.
static UMS_ACTIVE: AtomicBool = AtomicBool::new(false);

struct ActiveGuard;

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        UMS_ACTIVE.store(false, Ordering::Release);
    }
}

/// UMS device state. Created by `enter_mode`, owned by the worker
/// thread for its whole life.
pub struct Ums {
    udc: Arc<Udc>,
    devs: Arc<BlockDevs>,
    platform: Arc<dyn Platform>,
    dma: Arc<dyn DmaOps>,

    dev: Option<Arc<dyn BlockDevice>>,
    block_count: u64,
    block_size: u32,
    partition_name: String,
    is_mounted: bool,
    is_read_only: bool,

    buf: Option<DmaBuffer>,
    cbw_buf: AlignedBuf<{ Cbw::SIZE }>,
    csw_buf: AlignedBuf<{ Csw::SIZE }>,

    sense_key: u8,
    asc: u8,
    ascq: u8,

    ep_in: Option<UdcEndpoint>,
    ep_out: Option<UdcEndpoint>,
    req_in: Option<Arc<UdcRequest>>,
    req_out: Option<Arc<UdcRequest>>,

    online: Arc<Event>,
    txn_done: Arc<Event>,
    active: Arc<AtomicBool>,
}

impl Ums {
    /// Initializes the gadget: controller init first, then endpoint and
    /// request allocation, then gadget registration (which activates the
    /// descriptor for enumeration).
    pub fn init(
        udc: Arc<Udc>,
        devs: Arc<BlockDevs>,
        scratch: &Arc<Scratch>,
        platform: Arc<dyn Platform>,
    ) -> KResult<Ums> {
        let buf = Scratch::transfer_buffer(scratch, STORAGE_BLOCK_SIZE)?;

        let online = Arc::new(Event::new());
        let txn_done = Arc::new(Event::new());

        udc.init(&UMS_DEVICE_DESC)?;

        let ep_in = udc.endpoint_alloc(EpDir::In)?;
        let ep_out = udc.endpoint_alloc(EpDir::Out)?;
        let req_in = udc.request_alloc(txn_done.clone())?;
        let req_out = udc.request_alloc(txn_done.clone())?;

        let notify_online = online.clone();
        let gadget = UdcGadget {
            ifc_class: UMS_CLASS,
            ifc_subclass: UMS_SUBCLASS,
            ifc_protocol: UMS_PROTOCOL,
            ifc_string: "Mass Storage",
            notify: Arc::new(move |event| match event {
                UdcEvent::Online => {
                    kprintln!("ums: USB connected");
                    notify_online.signal();
                }
                UdcEvent::Offline => {
                    kprintln!("ums: USB disconnected");
                }
            }),
        };
        udc.register_gadget(&gadget)?;

        kprintln!("ums: initialized");

        Ok(Ums {
            udc,
            devs,
            platform,
            dma: scratch.ops(),
            dev: None,
            block_count: 0,
            block_size: 0,
            partition_name: String::new(),
            is_mounted: false,
            is_read_only: false,
            buf: Some(buf),
            cbw_buf: AlignedBuf::new(),
            csw_buf: AlignedBuf::new(),
            sense_key: scsi::SENSE_NO_SENSE,
            asc: 0,
            ascq: 0,
            ep_in: Some(ep_in),
            ep_out: Some(ep_out),
            req_in: Some(req_in),
            req_out: Some(req_out),
            online,
            txn_done,
            active: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.is_read_only = read_only;
    }

    fn active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Opens the exported partition, retrying while the block layer
    /// finishes publishing devices. Falls back to a GPT-label lookup
    /// when the direct open misses.
    pub fn mount_partition(&mut self, name: &str) -> KResult<()> {
        for attempt in 0..MOUNT_RETRIES {
            if attempt > 0 {
                self.platform.sleep_ms(MOUNT_RETRY_MS);
            }
            let dev = self
                .devs
                .open(name)
                .or_else(|| self.devs.by_label(name));
            if let Some(dev) = dev {
                self.block_count = dev.num_blocks();
                self.block_size = dev.block_size();
                self.partition_name = String::from(name);
                self.is_mounted = true;
                self.is_read_only = false;
                self.dev = Some(dev);
                kprintln!(
                    "ums: mounted partition '{}' - {} blocks of {} bytes",
                    name,
                    self.block_count,
                    self.block_size
                );
                return Ok(());
            }
        }

        kprintln!("ums: failed to open partition '{}'", name);
        Err(KError::NotFound)
    }

    fn unmount_partition(&mut self) {
        if self.dev.take().is_some() {
            kprintln!("ums: partition unmounted");
        }
        self.is_mounted = false;
        self.partition_name = String::new();
    }

    fn set_sense(&mut self, key: u8, asc: u8, ascq: u8) {
        self.sense_key = key;
        self.asc = asc;
        self.ascq = ascq;
    }

    fn xfer_buf(&self) -> KResult<&DmaBuffer> {
        self.buf.as_ref().ok_or(KError::Invalid)
    }

    /// Bulk-IN of `len` bytes from the transfer buffer, chunked to the
    /// controller's per-request limit. Cache is cleaned before every
    /// queued chunk. Returns the bytes the host actually took.
    fn usb_send(&self, len: usize) -> KResult<usize> {
        let buf = self.xfer_buf()?;
        let ep = self.ep_in.clone().ok_or(KError::Invalid)?;
        let req = self.req_in.clone().ok_or(KError::Invalid)?;
        let max = self.udc.max_transfer_len();

        let mut off = 0;
        while off < len {
            let chunk = core::cmp::min(len - off, max);
            buf.clean_invalidate(off, chunk);
            req.prepare(buf.phys(off), chunk);
            self.udc.queue(&ep, &req)?;
            self.txn_done.wait();
            if req.status() != REQ_STATUS_OK {
                return Err(KError::IO);
            }
            let actual = req.actual();
            off += actual;
            if actual < chunk {
                break;
            }
        }
        Ok(off)
    }

    /// Bulk-OUT into the transfer buffer, chunked; the buffer range is
    /// invalidated after every completion before the CPU reads it.
    fn usb_recv(&self, len: usize) -> KResult<usize> {
        let buf = self.xfer_buf()?;
        let ep = self.ep_out.clone().ok_or(KError::Invalid)?;
        let req = self.req_out.clone().ok_or(KError::Invalid)?;
        let max = self.udc.max_transfer_len();

        let mut off = 0;
        while off < len {
            let chunk = core::cmp::min(len - off, max);
            req.prepare(buf.phys(off), chunk);
            self.udc.queue(&ep, &req)?;
            self.txn_done.wait();
            if req.status() != REQ_STATUS_OK {
                return Err(KError::IO);
            }
            let actual = req.actual();
            buf.invalidate(off, actual);
            off += actual;
            if actual < chunk {
                break;
            }
        }
        Ok(off)
    }

    /// Copies a small response through the transfer buffer, truncated
    /// to the host's requested length.
    fn send_response(&self, data: &[u8], requested: u32) -> KResult<usize> {
        let len = core::cmp::min(data.len(), requested as usize);
        if len == 0 {
            return Ok(0);
        }
        self.xfer_buf()?.write(0, &data[..len]);
        self.usb_send(len)
    }

    fn scsi_test_unit_ready(&mut self) -> KResult<usize> {
        if self.is_mounted {
            self.set_sense(scsi::SENSE_NO_SENSE, 0, 0);
            Ok(0)
        } else {
            self.set_sense(scsi::SENSE_NOT_READY, scsi::ASC_MEDIUM_NOT_PRESENT, 0);
            Err(KError::NotFound)
        }
    }

    fn scsi_request_sense(&mut self, cbw: &Cbw) -> KResult<usize> {
        let mut sense = [0u8; 18];
        sense[0] = 0x70; // current errors, fixed format
        sense[2] = self.sense_key;
        sense[7] = 10; // additional sense length
        sense[12] = self.asc;
        sense[13] = self.ascq;

        let sent = self.send_response(&sense, cbw.data_transfer_length)?;

        // Sense is cleared once reported.
        self.set_sense(scsi::SENSE_NO_SENSE, 0, 0);
        Ok(sent)
    }

    fn scsi_inquiry(&self, cbw: &Cbw) -> KResult<usize> {
        let mut inquiry = [0u8; 36];
        // [0]: direct-access block device, qualifier 0
        inquiry[1] = 0x80; // removable medium
        inquiry[2] = 4; // SPC-2
        inquiry[3] = 2; // response data format
        inquiry[4] = 31; // additional length
        inquiry[8..16].copy_from_slice(INQUIRY_VENDOR);
        inquiry[16..32].copy_from_slice(INQUIRY_PRODUCT);
        inquiry[32..36].copy_from_slice(INQUIRY_REVISION);

        self.send_response(&inquiry, cbw.data_transfer_length)
    }

    fn scsi_mode_sense_6(&self, cbw: &Cbw) -> KResult<usize> {
        let mode = [
            3, // mode data length
            0, // medium type
            if self.is_read_only { 0x80 } else { 0x00 },
            0, // block descriptor length
        ];
        self.send_response(&mode, cbw.data_transfer_length)
    }

    fn scsi_read_capacity(&mut self, cbw: &Cbw) -> KResult<usize> {
        if !self.is_mounted {
            self.set_sense(scsi::SENSE_NOT_READY, scsi::ASC_MEDIUM_NOT_PRESENT, 0);
            return Err(KError::NotFound);
        }

        let mut capacity = [0u8; 8];
        capacity[0..4].copy_from_slice(&((self.block_count - 1) as u32).to_be_bytes());
        capacity[4..8].copy_from_slice(&self.block_size.to_be_bytes());
        self.send_response(&capacity, cbw.data_transfer_length)
    }

    /// CDB bytes 2..5: big-endian LBA; bytes 7..8: 16-bit block count.
    fn parse_rw_cdb(cbw: &Cbw) -> (u64, u32) {
        let lba = u32::from_be_bytes([cbw.cb[2], cbw.cb[3], cbw.cb[4], cbw.cb[5]]) as u64;
        let count = u16::from_be_bytes([cbw.cb[7], cbw.cb[8]]) as u32;
        (lba, count)
    }

    fn scsi_read_10(&mut self, cbw: &Cbw) -> KResult<usize> {
        let dev = match (&self.dev, self.is_mounted) {
            (Some(dev), true) => dev.clone(),
            _ => {
                self.set_sense(scsi::SENSE_NOT_READY, scsi::ASC_MEDIUM_NOT_PRESENT, 0);
                return Err(KError::NotFound);
            }
        };

        let (lba, count) = Self::parse_rw_cdb(cbw);
        if lba + count as u64 > self.block_count {
            self.set_sense(scsi::SENSE_ILLEGAL_REQUEST, scsi::ASC_INVALID_FIELD_IN_CDB, 0);
            return Err(KError::OutOfRange);
        }

        let bs = self.block_size as usize;
        let buf_blocks = (self.xfer_buf()?.len() / bs) as u32;
        if buf_blocks == 0 {
            return Err(KError::Invalid);
        }

        let mut sent = 0usize;
        let mut remaining = count;
        let mut current_lba = lba;

        while remaining > 0 {
            let blocks = core::cmp::min(remaining, buf_blocks);
            let bytes = blocks as usize * bs;

            let read = {
                let buf = self.xfer_buf()?;
                // In flight: nothing is queued on the buffer right now.
                let slice = unsafe { buf.slice_mut(0, bytes) };
                dev.read_blocks(current_lba, blocks, slice)
            };
            if read.is_err() {
                kprintln!("ums: block read failed at lba {}", current_lba);
                self.set_sense(scsi::SENSE_MEDIUM_ERROR, 0, 0);
                return Err(KError::IO);
            }

            sent += self.usb_send(bytes)?;
            current_lba += blocks as u64;
            remaining -= blocks;
        }

        Ok(sent)
    }

    fn scsi_write_10(&mut self, cbw: &Cbw) -> KResult<usize> {
        let dev = match (&self.dev, self.is_mounted) {
            (Some(dev), true) => dev.clone(),
            _ => {
                self.set_sense(scsi::SENSE_NOT_READY, scsi::ASC_MEDIUM_NOT_PRESENT, 0);
                return Err(KError::NotFound);
            }
        };

        if self.is_read_only {
            self.set_sense(scsi::SENSE_ILLEGAL_REQUEST, scsi::ASC_WRITE_PROTECTED, 0);
            return Err(KError::NotSupported);
        }

        let (lba, count) = Self::parse_rw_cdb(cbw);
        if lba + count as u64 > self.block_count {
            self.set_sense(scsi::SENSE_ILLEGAL_REQUEST, scsi::ASC_INVALID_FIELD_IN_CDB, 0);
            return Err(KError::OutOfRange);
        }

        let bs = self.block_size as usize;
        let buf_blocks = (self.xfer_buf()?.len() / bs) as u32;
        if buf_blocks == 0 {
            return Err(KError::Invalid);
        }

        let mut received = 0usize;
        let mut remaining = count;
        let mut current_lba = lba;

        while remaining > 0 {
            let blocks = core::cmp::min(remaining, buf_blocks);
            let bytes = blocks as usize * bs;

            let got = self.usb_recv(bytes)?;
            if got != bytes {
                return Err(KError::IO);
            }

            let written = {
                let buf = self.xfer_buf()?;
                let slice = unsafe { buf.slice(0, bytes) };
                dev.write_blocks(current_lba, blocks, slice)
            };
            if written.is_err() {
                kprintln!("ums: block write failed at lba {}", current_lba);
                self.set_sense(scsi::SENSE_MEDIUM_ERROR, 0, 0);
                return Err(KError::IO);
            }

            received += got;
            current_lba += blocks as u64;
            remaining -= blocks;
        }

        Ok(received)
    }

    /// Dispatch on the SCSI opcode, producing the CSW status and
    /// residue. Failed commands report the full expected data length as
    /// residue; successful ones report what was left untransferred.
    fn handle_scsi(&mut self, cbw: &Cbw) -> (u8, u32) {
        let requested = cbw.data_transfer_length;

        let result = match cbw.cb[0] {
            scsi::TEST_UNIT_READY => self.scsi_test_unit_ready(),
            scsi::REQUEST_SENSE => self.scsi_request_sense(cbw),
            scsi::INQUIRY => self.scsi_inquiry(cbw),
            scsi::MODE_SENSE_6 => self.scsi_mode_sense_6(cbw),
            scsi::READ_CAPACITY_10 => self.scsi_read_capacity(cbw),
            scsi::READ_10 => self.scsi_read_10(cbw),
            scsi::WRITE_10 => self.scsi_write_10(cbw),
            scsi::START_STOP_UNIT | scsi::PREVENT_ALLOW_MEDIUM_REMOVAL | scsi::VERIFY_10 => {
                // Accepted but nothing to do.
                Ok(0)
            }
            scsi::READ_FORMAT_CAPACITIES => {
                self.set_sense(scsi::SENSE_ILLEGAL_REQUEST, scsi::ASC_INVALID_COMMAND, 0);
                Err(KError::NotSupported)
            }
            opcode => {
                kprintln!("ums: unsupported SCSI command {:#04x}", opcode);
                self.set_sense(scsi::SENSE_ILLEGAL_REQUEST, scsi::ASC_INVALID_COMMAND, 0);
                Err(KError::NotSupported)
            }
        };

        match result {
            Ok(moved) => (CSW_STATUS_GOOD, requested.saturating_sub(moved as u32)),
            Err(_) => (CSW_STATUS_FAILED, requested),
        }
    }

    fn send_csw(&mut self, tag: u32, residue: u32, status: u8) {
        let csw = Csw {
            tag,
            data_residue: residue,
            status,
        };
        self.csw_buf.0.copy_from_slice(&csw.to_bytes());

        let (ep, req) = match (&self.ep_in, &self.req_in) {
            (Some(ep), Some(req)) => (ep.clone(), req.clone()),
            _ => return,
        };

        self.dma
            .clean_invalidate(self.csw_buf.addr(), align_up(Csw::SIZE, CACHE_LINE));
        req.prepare(self.dma.virt_to_phys(self.csw_buf.addr()), Csw::SIZE);
        if self.udc.queue(&ep, &req).is_ok() {
            self.txn_done.wait();
        }
    }

    /// Full wrapper cycle: SCSI dispatch plus status stage.
    fn handle_cbw(&mut self, cbw: &Cbw) {
        let (status, residue) = self.handle_scsi(cbw);
        self.send_csw(cbw.tag, residue, status);
    }

    /// Main loop of the worker thread.
    fn run(&mut self) {
        kprintln!(
            "ums: starting mass storage mode for partition '{}'",
            self.partition_name
        );

        self.online.wait();
        self.platform.sleep_ms(ONLINE_SETTLE_MS);

        while self.active() {
            self.cbw_buf.0.fill(0);
            self.dma
                .clean_invalidate(self.cbw_buf.addr(), align_up(Cbw::SIZE, CACHE_LINE));

            let (ep, req) = match (&self.ep_out, &self.req_out) {
                (Some(ep), Some(req)) => (ep.clone(), req.clone()),
                _ => break,
            };
            req.prepare(self.dma.virt_to_phys(self.cbw_buf.addr()), Cbw::SIZE);
            if self.udc.queue(&ep, &req).is_err() {
                break;
            }
            self.txn_done.wait();
            if req.status() != REQ_STATUS_OK {
                // Canceled or errored; the loop condition decides.
                continue;
            }

            self.dma
                .invalidate(self.cbw_buf.addr(), align_up(Cbw::SIZE, CACHE_LINE));
            let received = req.actual().min(Cbw::SIZE);

            let cbw = match Cbw::from_bytes(&self.cbw_buf.0[..received]) {
                Some(cbw) => cbw,
                None => {
                    kprintln!("ums: invalid CBW ({} bytes), stalling endpoints", received);
                    if let Some(ep_in) = &self.ep_in {
                        self.udc.endpoint_stall(ep_in);
                    }
                    self.udc.endpoint_stall(&ep);
                    continue;
                }
            };

            self.handle_cbw(&cbw);
        }

        self.active.store(false, Ordering::Release);
        kprintln!("ums: mass storage mode ended");
    }

    /// Teardown, run by the worker after the loop ends: unmount, drop
    /// the scratch buffer reference (the memory stays with the
    /// platform), free requests and endpoints, zero the state.
    fn exit_mode(&mut self) {
        self.unmount_partition();
        self.buf = None;

        if let Some(req) = self.req_in.take() {
            self.udc.request_free(req);
        }
        if let Some(req) = self.req_out.take() {
            self.udc.request_free(req);
        }
        if let Some(ep) = self.ep_in.take() {
            self.udc.endpoint_free(&ep);
        }
        if let Some(ep) = self.ep_out.take() {
            self.udc.endpoint_free(&ep);
        }

        self.set_sense(scsi::SENSE_NO_SENSE, 0, 0);
        self.block_count = 0;
        self.block_size = 0;
        self.is_read_only = false;

        kprintln!("ums: cleanup complete");
    }
}

/// Enters mass storage mode on `partition` and blocks the caller until
/// `q` (or `Q`) arrives on the serial console.
///
/// Exactly one instance may be active at a time; a second call returns
/// immediately.
pub fn enter_mode(
    partition: &str,
    devs: Arc<BlockDevs>,
    udc: Arc<Udc>,
    scratch: &Arc<Scratch>,
    console: Arc<dyn Console>,
    platform: Arc<dyn Platform>,
) -> KResult<()> {
    if UMS_ACTIVE.swap(true, Ordering::AcqRel) {
        kprintln!("ums: already active");
        return Ok(());
    }
    let _guard = ActiveGuard;

    let mut ums = Ums::init(udc.clone(), devs, scratch, platform.clone())?;

    if let Err(e) = ums.mount_partition(partition) {
        ums.exit_mode();
        return Err(e);
    }

    udc.start()?;

    let active = ums.active.clone();
    active.store(true, Ordering::Release);

    let done = Arc::new(Event::new());
    let worker_done = done.clone();
    if let Err(e) = platform.spawn(
        "ums",
        Box::new(move || {
            ums.run();
            ums.exit_mode();
            worker_done.signal();
        }),
    ) {
        active.store(false, Ordering::Release);
        let _ = udc.stop();
        return Err(e);
    }

    kprintln!("ums: mass storage mode active, connect USB cable");
    kprintln!("ums: press 'q' to exit");

    loop {
        match console.getc() {
            Some(b'q') | Some(b'Q') => break,
            _ => platform.sleep_ms(100),
        }
        if !active.load(Ordering::Acquire) {
            // Worker bailed out on its own.
            break;
        }
    }

    kprintln!("ums: exit requested");
    active.store(false, Ordering::Release);
    // Stopping the controller cancels the outstanding transfer and
    // unblocks the worker.
    let _ = udc.stop();
    done.wait();

    Ok(())
}
