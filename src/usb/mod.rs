//! USB device-controller abstraction for gadget mode.
//!
//! The boot core drives one of two controller families through a small
//! capability set injected at init. The hardware driver lives in the
//! hosting bootloader; here we keep the per-family transfer limits, the
//! endpoint/request bookkeeping and the completion signaling.

#![allow(dead_code)]

pub mod dma;
pub mod ums;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use crate::sync::Event;
use crate::util::{KError, KResult};

/// Supported controller families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerKind {
    /// Legacy high-speed controller.
    Hsusb,
    /// SuperSpeed "dwc" controller.
    Dwc,
}

impl ControllerKind {
    pub fn from_type_str(s: &str) -> Option<ControllerKind> {
        match s {
            "hsusb" => Some(ControllerKind::Hsusb),
            "dwc" => Some(ControllerKind::Dwc),
            _ => None,
        }
    }

    /// Maximum bytes a single queued request may carry.
    pub fn max_transfer_len(self) -> usize {
        match self {
            ControllerKind::Hsusb => 32 * 1024,
            ControllerKind::Dwc => 16 * 1024 * 1024,
        }
    }

    /// Bulk endpoint max packet size (USB 2.0 vs 3.x).
    pub fn bulk_max_packet(self) -> u16 {
        match self {
            ControllerKind::Hsusb => 512,
            ControllerKind::Dwc => 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpDir {
    In,
    Out,
}

/// An allocated bulk endpoint.
#[derive(Debug, Clone)]
pub struct UdcEndpoint {
    pub id: u32,
    pub dir: EpDir,
    pub max_packet: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdcEvent {
    Online,
    Offline,
}

/// Device descriptor constants presented on enumeration.
pub struct UdcDeviceDesc {
    pub vendor_id: u16,
    pub product_id: u16,
    pub version_id: u16,
    pub manufacturer: &'static str,
    pub product: &'static str,
}

/// Gadget (interface) description registered with the controller.
pub struct UdcGadget {
    pub ifc_class: u8,
    pub ifc_subclass: u8,
    pub ifc_protocol: u8,
    pub ifc_string: &'static str,
    pub notify: Arc<dyn Fn(UdcEvent) + Send + Sync>,
}

/// Request completion status values.
pub const REQ_STATUS_OK: i32 = 0;
pub const REQ_STATUS_CANCELED: i32 = -1;
pub const REQ_STATUS_ERROR: i32 = -2;

/// One in-flight transfer descriptor.
///
/// The driver reads `buf`/`len`, performs the transfer, then calls
/// `complete` from its completion context. `complete` only stores the
/// observed length and signals the event - it must never block.
pub struct UdcRequest {
    buf: AtomicUsize,
    len: AtomicUsize,
    actual: AtomicUsize,
    status: AtomicI32,
    done: Arc<Event>,
}

impl UdcRequest {
    pub fn new(done: Arc<Event>) -> Self {
        Self {
            buf: AtomicUsize::new(0),
            len: AtomicUsize::new(0),
            actual: AtomicUsize::new(0),
            status: AtomicI32::new(REQ_STATUS_OK),
            done,
        }
    }

    /// Arms the request with a bus address and length before queueing.
    pub fn prepare(&self, buf: usize, len: usize) {
        self.buf.store(buf, Ordering::Relaxed);
        self.len.store(len, Ordering::Relaxed);
        self.actual.store(0, Ordering::Relaxed);
        self.status.store(REQ_STATUS_OK, Ordering::Relaxed);
    }

    pub fn buf(&self) -> usize {
        self.buf.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Completion hook, called by the controller driver.
    pub fn complete(&self, actual: usize, status: i32) {
        self.actual.store(actual, Ordering::Release);
        self.status.store(status, Ordering::Release);
        self.done.signal();
    }

    pub fn actual(&self) -> usize {
        self.actual.load(Ordering::Acquire)
    }

    pub fn status(&self) -> i32 {
        self.status.load(Ordering::Acquire)
    }
}

/// Controller capability set, injected at construction.
pub trait UdcOps: Send + Sync {
    fn init(&self, device: &UdcDeviceDesc) -> KResult<()>;

    fn start(&self) -> KResult<()>;

    /// Stop the controller. Any outstanding request must be completed
    /// as canceled so waiters wake up.
    fn stop(&self) -> KResult<()>;

    /// Activates the descriptor presented on enumeration. Endpoints
    /// must already be allocated.
    fn register_gadget(&self, gadget: &UdcGadget) -> KResult<()>;

    fn endpoint_alloc(&self, dir: EpDir, max_packet: u16) -> KResult<UdcEndpoint>;

    /// Optional hook; controllers without one keep the default and the
    /// caller tolerates the `false`.
    fn endpoint_free(&self, _ep: &UdcEndpoint) -> bool {
        false
    }

    /// Halt a bulk endpoint. Default no-op for controllers without a
    /// stall primitive.
    fn endpoint_stall(&self, _ep: &UdcEndpoint) {}

    fn request_alloc(&self, done: Arc<Event>) -> KResult<Arc<UdcRequest>> {
        Ok(Arc::new(UdcRequest::new(done)))
    }

    fn request_free(&self, _req: Arc<UdcRequest>) {}

    /// Queue a transfer on an endpoint. Exactly one request per
    /// endpoint may be outstanding.
    fn queue(&self, ep: &UdcEndpoint, req: &Arc<UdcRequest>) -> KResult<()>;
}

/// A controller: the family limits plus the injected function table.
pub struct Udc {
    kind: ControllerKind,
    ops: Arc<dyn UdcOps>,
}

impl Udc {
    /// Builds the function table for a controller-type string.
    pub fn new(controller: &str, ops: Arc<dyn UdcOps>) -> KResult<Udc> {
        let kind = ControllerKind::from_type_str(controller).ok_or(KError::NotSupported)?;
        Ok(Udc { kind, ops })
    }

    pub fn kind(&self) -> ControllerKind {
        self.kind
    }

    pub fn max_transfer_len(&self) -> usize {
        self.kind.max_transfer_len()
    }

    pub fn bulk_max_packet(&self) -> u16 {
        self.kind.bulk_max_packet()
    }

    pub fn init(&self, device: &UdcDeviceDesc) -> KResult<()> {
        self.ops.init(device)
    }

    pub fn start(&self) -> KResult<()> {
        self.ops.start()
    }

    pub fn stop(&self) -> KResult<()> {
        self.ops.stop()
    }

    pub fn register_gadget(&self, gadget: &UdcGadget) -> KResult<()> {
        self.ops.register_gadget(gadget)
    }

    pub fn endpoint_alloc(&self, dir: EpDir) -> KResult<UdcEndpoint> {
        self.ops.endpoint_alloc(dir, self.kind.bulk_max_packet())
    }

    pub fn endpoint_free(&self, ep: &UdcEndpoint) -> bool {
        self.ops.endpoint_free(ep)
    }

    pub fn endpoint_stall(&self, ep: &UdcEndpoint) {
        self.ops.endpoint_stall(ep)
    }

    pub fn request_alloc(&self, done: Arc<Event>) -> KResult<Arc<UdcRequest>> {
        self.ops.request_alloc(done)
    }

    pub fn request_free(&self, req: Arc<UdcRequest>) {
        self.ops.request_free(req)
    }

    pub fn queue(&self, ep: &UdcEndpoint, req: &Arc<UdcRequest>) -> KResult<()> {
        self.ops.queue(ep, req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_kind_limits() {
        assert_eq!(ControllerKind::from_type_str("hsusb"), Some(ControllerKind::Hsusb));
        assert_eq!(ControllerKind::from_type_str("dwc"), Some(ControllerKind::Dwc));
        assert_eq!(ControllerKind::from_type_str("xhci"), None);

        assert_eq!(ControllerKind::Hsusb.max_transfer_len(), 32 * 1024);
        assert_eq!(ControllerKind::Dwc.max_transfer_len(), 16 * 1024 * 1024);
        assert_eq!(ControllerKind::Hsusb.bulk_max_packet(), 512);
        assert_eq!(ControllerKind::Dwc.bulk_max_packet(), 1024);
    }

    #[test]
    fn request_completion_signals_event() {
        let done = Arc::new(Event::new());
        let req = UdcRequest::new(done.clone());
        req.prepare(0x1000, 31);
        assert_eq!(req.len(), 31);

        req.complete(31, REQ_STATUS_OK);
        done.wait();
        assert_eq!(req.actual(), 31);
        assert_eq!(req.status(), REQ_STATUS_OK);

        // prepare() re-arms the bookkeeping.
        req.prepare(0x2000, 13);
        assert_eq!(req.actual(), 0);
    }
}
