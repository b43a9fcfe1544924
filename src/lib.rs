//! abboot - boot-phase core of a secondary bootloader.
//!
//! Three tightly coupled pieces decide what to boot and expose storage
//! to a host:
//!
//! - a persistent boot-counting environment (U-Boot format) tracking
//!   which of two redundant root slots to try next,
//! - a filesystem-based boot dispatcher that mounts the chosen slot,
//!   parses its extlinux descriptor and hands off to the kernel loader,
//! - a USB Mass Storage target exposing a named partition over the
//!   bulk-only transport.
//!
//! Block I/O, filesystem drivers, the USB device controller, the serial
//! console and thread/timer services are injected by the hosting
//! bootloader through the traits in `storage`, `fs`, `usb`, `console`
//! and `platform`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod boot;
pub mod console;
pub mod fs;
pub mod menu;
pub mod platform;
pub mod storage;
pub mod sync;
pub mod usb;
pub mod util;
