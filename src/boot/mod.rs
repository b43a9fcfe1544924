//! Boot dispatcher: drive the A/B slot choice end-to-end and hand the
//! selected extlinux entry to the kernel loader.

#![allow(dead_code)]

pub mod ab;
pub mod cmdline;
pub mod extlinux;
pub mod ubootenv;

pub use ab::{AbBoot, Slot};
pub use cmdline::PassFlags;
pub use extlinux::{BootEntry, ExtlinuxConf, EXTLINUX_PATH};
pub use ubootenv::UbootEnv;

use alloc::string::String;
use alloc::sync::Arc;

use crate::fs::{FsDriver, Filesystem};
use crate::kprintln;
use crate::menu;
use crate::storage::{BlockDevice, BlockDevs};
use crate::util::{KError, KResult};

/// Partitions smaller than this cannot hold a boot filesystem, except
/// when their GPT label marks them as a boot partition.
pub const BOOT_MIN_FS_SIZE: u64 = 16 * 1024 * 1024;

/// Name under which the selected slot's window is published.
pub const AB_SLOT_SUBDEV: &str = "ab-slot";

/// Stages of a single dispatcher invocation, for log lines and failure
/// policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStep {
    Init,
    ResolveBase,
    LoadEnv,
    PickSlot,
    Persist,
    PublishSubdev,
    Mount,
    ParseEntry,
    HandOff,
}

impl BootStep {
    /// Post-mount failures abort the A/B attempt outright: retrying
    /// other media at that point would sidestep the counter discipline.
    fn is_terminal(self) -> bool {
        matches!(self, BootStep::ParseEntry | BootStep::HandOff)
    }
}

/// Build-time boot configuration.
#[derive(Debug, Clone)]
pub struct BootConfig {
    /// U-Boot env partition; `None` disables A/B entirely.
    pub base_device: Option<String>,
    pub env_offset: u64,
    pub env_size: usize,
    pub slot_a_offset: u64,
    pub slot_b_offset: u64,
    /// Serial countdown before autoboot, in seconds.
    pub menu_timeout_secs: u32,
}

impl Default for BootConfig {
    fn default() -> Self {
        // Default userdata layout: env block early in the partition,
        // slot roots at fixed offsets behind it.
        Self {
            base_device: Some(String::from("mmcblk0p20")),
            env_offset: 0x10000,
            env_size: 0x20000,
            slot_a_offset: 0x0010_0000,
            slot_b_offset: 0x0410_0000,
            menu_timeout_secs: 3,
        }
    }
}

/// Everything the loader needs for the selected entry.
pub struct BootRequest<'a> {
    pub entry: &'a BootEntry,
    /// Pass-through keys parsed from the entry's `append` line.
    pub pass: PassFlags,
}

/// Kernel image loading and handoff, owned by the hosting bootloader.
/// On real hardware a successful `boot` does not return.
pub trait KernelLoader {
    fn boot(&mut self, fs: &Arc<dyn Filesystem>, request: &BootRequest) -> KResult<()>;
}

pub struct BootCtx<'a> {
    pub devs: Arc<BlockDevs>,
    pub fs: Arc<dyn FsDriver>,
    pub loader: &'a mut dyn KernelLoader,
    pub ab: AbBoot,
    pub config: BootConfig,
    /// Block-device enumeration hook, run once.
    pub enumerate: Option<&'a (dyn Fn(&BlockDevs) + Sync)>,
}

/// Full boot-phase entry point: enumerate, countdown, scan, boot.
/// Diverts into the serial menu on a keypress or when no boot path
/// succeeds.
pub fn run(ctx: &mut BootCtx, menu_ctx: &menu::MenuCtx) -> KResult<()> {
    if let Some(enumerate) = ctx.enumerate.take() {
        ctx.devs.ensure_enumerated(|d| enumerate(d));
    }

    if menu::countdown_check(
        menu_ctx.console.as_ref(),
        menu_ctx.platform.as_ref(),
        ctx.config.menu_timeout_secs,
    ) {
        menu::serial_menu(menu_ctx);
    }

    match scan_and_boot(ctx) {
        Ok(()) => Ok(()),
        Err(e) => {
            kprintln!("boot: no bootable file system found ({:?})", e);
            menu::serial_menu(menu_ctx);
            Err(e)
        }
    }
}

/// Scan filesystems and try to boot, preferring the A/B path.
pub fn scan_and_boot(ctx: &mut BootCtx) -> KResult<()> {
    // Early A/B bootstrap from build configuration, only when nothing
    // initialized it before.
    if !ctx.ab.is_initialized() {
        if let Some(base) = ctx.config.base_device.clone() {
            if ctx
                .ab
                .init(&ctx.devs, &base, ctx.config.env_offset, ctx.config.env_size)
                .is_ok()
            {
                ctx.ab
                    .set_offsets(ctx.config.slot_a_offset, ctx.config.slot_b_offset);
            }
        }
    }

    kprintln!("boot: trying to boot from the file system...");

    if ctx.ab.is_initialized() {
        match try_ab_boot(ctx) {
            Ok(()) => return Ok(()),
            Err((step, e)) => {
                kprintln!("boot: A/B boot failed at {:?}: {:?}", step, e);
                if step.is_terminal() {
                    return Err(e);
                }
            }
        }
    }

    scan_devices(ctx)
}

/// The A/B path: burn an attempt, publish the slot window, mount it and
/// boot the slot-suffixed extlinux entry.
fn try_ab_boot(ctx: &mut BootCtx) -> Result<(), (BootStep, KError)> {
    ctx.ab
        .pre_boot(&ctx.devs)
        .map_err(|e| (BootStep::Persist, e))?;

    let slot = ctx.ab.current_slot();
    let base = String::from(
        ctx.ab
            .base_device()
            .ok_or((BootStep::ResolveBase, KError::NotFound))?,
    );
    let offset = ctx
        .ab
        .slot_offset()
        .ok_or((BootStep::PublishSubdev, KError::Invalid))?;

    let parent = ctx
        .devs
        .open(&base)
        .ok_or((BootStep::ResolveBase, KError::NotFound))?;

    // Window spans from the slot offset to the end of the base device.
    let block_size = parent.block_size() as u64;
    let start_block = offset / block_size;
    let num_blocks = parent
        .num_blocks()
        .checked_sub(start_block)
        .ok_or((BootStep::PublishSubdev, KError::OutOfRange))?;

    let subdev = ctx
        .devs
        .publish_subdevice(&base, AB_SLOT_SUBDEV, start_block, num_blocks)
        .map_err(|e| (BootStep::PublishSubdev, e))?;

    kprintln!(
        "boot: created subdevice '{}' at block {} ({:#x} bytes in)",
        AB_SLOT_SUBDEV,
        start_block,
        offset
    );

    let fs = ctx
        .fs
        .mount(subdev)
        .map_err(|e| (BootStep::Mount, e))?;

    boot_extlinux(ctx.loader, &fs, Some(slot))
}

/// Fallback: scan all leaf block devices for a bootable filesystem
/// (non-A/B mode).
fn scan_devices(ctx: &mut BootCtx) -> KResult<()> {
    for bdev in ctx.devs.devices() {
        if !bdev.is_leaf() {
            continue;
        }

        // Skip partitions too small for a boot fs. A small 'boot'
        // partition is still allowed so a next-stage bootloader package
        // can live there.
        let boot_label = bdev
            .label()
            .map(|l| l.starts_with("boot"))
            .unwrap_or(false);
        if bdev.size() < BOOT_MIN_FS_SIZE && !boot_label {
            continue;
        }

        let fs = match ctx.fs.mount(bdev.clone()) {
            Ok(fs) => fs,
            Err(_) => continue,
        };

        kprintln!("boot: scanning '{}'...", bdev.name());
        if boot_extlinux(ctx.loader, &fs, None).is_ok() {
            return Ok(());
        }
    }


    kprintln!("boot: bootable file system not found");
    Err(KError::NotFound)
}

/// Parse the extlinux descriptor on `fs` and hand the selected entry to
/// the loader.
fn boot_extlinux(
    loader: &mut dyn KernelLoader,
    fs: &Arc<dyn Filesystem>,
    slot: Option<Slot>,
) -> Result<(), (BootStep, KError)> {
    let raw = fs
        .read_file(EXTLINUX_PATH)
        .map_err(|e| (BootStep::ParseEntry, e))?;
    let text =
        core::str::from_utf8(&raw).map_err(|_| (BootStep::ParseEntry, KError::Invalid))?;
    let conf = ExtlinuxConf::parse(text);

    let entry = match conf.select(slot) {
        Some(entry) => entry,
        None => {
            if let Some(slot) = slot {
                kprintln!("boot: no extlinux label for slot {}", slot.as_char());
            }
            return Err((BootStep::ParseEntry, KError::NotFound));
        }
    };

    let pass = cmdline::parse(entry.append.as_deref().unwrap_or(""));
    kprintln!("boot: booting label '{}'", entry.label);

    loader
        .boot(fs, &BootRequest { entry, pass })
        .map_err(|e| (BootStep::HandOff, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use crate::fs::{MemFs, MemFsDriver};
    use crate::storage::RamDisk;

    const CONF: &str = "\
default linux
label linux_A
    kernel /vmlinuz-A
    initrd /initramfs-A
    append root=/dev/mapper/rootfs_a lk2nd.pass-simplefb=rgb565
label linux_B
    kernel /vmlinuz-B
    append root=/dev/mapper/rootfs_b
";

    struct TestLoader {
        booted: Vec<(String, Option<String>, PassFlags)>,
        fail: bool,
    }

    impl TestLoader {
        fn new() -> Self {
            Self {
                booted: Vec::new(),
                fail: false,
            }
        }
    }

    impl KernelLoader for TestLoader {
        fn boot(&mut self, _fs: &Arc<dyn Filesystem>, request: &BootRequest) -> KResult<()> {
            self.booted.push((
                request.entry.label.clone(),
                request.entry.kernel.clone(),
                request.pass,
            ));
            if self.fail {
                Err(KError::IO)
            } else {
                Ok(())
            }
        }
    }

    fn ab_config() -> BootConfig {
        BootConfig {
            base_device: Some(String::from("mmcblk0p20")),
            env_offset: 0x10000,
            env_size: 0x20000,
            slot_a_offset: 0x0010_0000,
            slot_b_offset: 0x0020_0000,
            menu_timeout_secs: 0,
        }
    }

    fn ab_devs() -> Arc<BlockDevs> {
        let devs = BlockDevs::new();
        // 4 MiB base device holding env + both slots.
        let disk = RamDisk::with_label("wrp0p19", "userdata", 512, 8192);
        disk.fill(0xFF);
        devs.register(Arc::new(disk)).unwrap();
        Arc::new(devs)
    }

    #[test]
    fn ab_boot_selects_slot_label() {
        let devs = ab_devs();
        let fsdrv = MemFsDriver::new();
        fsdrv.add_image("ab-slot", MemFs::new().insert(EXTLINUX_PATH, CONF.as_bytes()));
        let mut loader = TestLoader::new();

        let mut ctx = BootCtx {
            devs: devs.clone(),
            fs: Arc::new(fsdrv),
            loader: &mut loader,
            ab: AbBoot::new(),
            config: ab_config(),
            enumerate: None,
        };

        scan_and_boot(&mut ctx).unwrap();

        // Subdevice published at the slot A offset.
        let sub = devs.open(AB_SLOT_SUBDEV).expect("ab-slot published");
        assert_eq!(sub.num_blocks(), 8192 - 0x0010_0000 / 512);

        // Slot A label booted with its pass flags, counter burned.
        assert_eq!(ctx.ab.env().unwrap().boot_left(Slot::A), 2);
        assert!(!ctx.ab.env().unwrap().is_dirty());
        assert_eq!(loader.booted.len(), 1);
        let (label, kernel, pass) = &loader.booted[0];
        assert_eq!(label, "linux_A");
        assert_eq!(kernel.as_deref(), Some("/vmlinuz-A"));
        assert_eq!(pass.simplefb, Some(cmdline::SimplefbFlags::RGB565));
    }

    #[test]
    fn missing_slot_label_is_fatal() {
        let devs = ab_devs();
        let fsdrv = MemFsDriver::new();
        // Config names `default linux` but carries no linux_A label.
        fsdrv.add_image(
            "ab-slot",
            MemFs::new().insert(EXTLINUX_PATH, b"default linux\nlabel linux\nkernel /z\n"),
        );
        let mut loader = TestLoader::new();

        let mut ctx = BootCtx {
            devs,
            fs: Arc::new(fsdrv),
            loader: &mut loader,
            ab: AbBoot::new(),
            config: ab_config(),
            enumerate: None,
        };

        assert_eq!(scan_and_boot(&mut ctx), Err(KError::NotFound));
        // The attempt was still recorded before the failure.
        assert_eq!(ctx.ab.env().unwrap().boot_left(Slot::A), 2);
        assert!(loader.booted.is_empty());
    }

    #[test]
    fn mount_failure_falls_back_to_scan() {
        let devs = ab_devs();
        // A mountable non-A/B device with a plain default entry.
        devs.register(Arc::new(RamDisk::new("sdcard", 512, 40 * 1024)))
            .unwrap();

        let fsdrv = MemFsDriver::new();
        // No image for "ab-slot": the A/B mount fails.
        fsdrv.add_image(
            "sdcard",
            MemFs::new().insert(EXTLINUX_PATH, b"default linux\nlabel linux\nkernel /v\n"),
        );
        let mut loader = TestLoader::new();

        let mut ctx = BootCtx {
            devs,
            fs: Arc::new(fsdrv),
            loader: &mut loader,
            ab: AbBoot::new(),
            config: ab_config(),
            enumerate: None,
        };

        scan_and_boot(&mut ctx).unwrap();
        assert_eq!(loader.booted[0].0, "linux");
    }

    #[test]
    fn fallback_scan_skips_small_devices() {
        let devs = Arc::new(BlockDevs::new());
        // Too small and unlabeled: must never be mounted.
        devs.register(Arc::new(RamDisk::new("tiny", 512, 2048)))
            .unwrap();
        // Small but labeled boot*: allowed.
        devs.register(Arc::new(RamDisk::with_label("bootp", "boot0", 512, 2048)))
            .unwrap();

        let fsdrv = MemFsDriver::new();
        fsdrv.add_image(
            "tiny",
            MemFs::new().insert(EXTLINUX_PATH, b"label bad\nkernel /bad\n"),
        );
        fsdrv.add_image(
            "bootp",
            MemFs::new().insert(EXTLINUX_PATH, b"label good\nkernel /good\n"),
        );
        let mut loader = TestLoader::new();

        let mut ctx = BootCtx {
            devs,
            fs: Arc::new(fsdrv),
            loader: &mut loader,
            ab: AbBoot::new(),
            config: BootConfig {
                base_device: None,
                ..ab_config()
            },
            enumerate: None,
        };

        scan_and_boot(&mut ctx).unwrap();
        assert_eq!(loader.booted.len(), 1);
        assert_eq!(loader.booted[0].0, "good");
    }

    #[test]
    fn no_bootable_device_reports_not_found() {
        let devs = Arc::new(BlockDevs::new());
        let mut loader = TestLoader::new();
        let mut ctx = BootCtx {
            devs,
            fs: Arc::new(MemFsDriver::new()),
            loader: &mut loader,
            ab: AbBoot::new(),
            config: BootConfig {
                base_device: None,
                ..ab_config()
            },
            enumerate: None,
        };
        assert_eq!(scan_and_boot(&mut ctx), Err(KError::NotFound));
    }

    #[test]
    fn enumerate_hook_runs_once_via_run_path() {
        // scan_and_boot does not enumerate; the hook belongs to run().
        // Exercised here directly against the registry.
        let devs = BlockDevs::new();
        let mut calls = 0;
        devs.ensure_enumerated(|_| calls += 1);
        devs.ensure_enumerated(|_| calls += 1);
        assert_eq!(calls, 1);
    }
}
