//! RAUC-compatible A/B slot management.
//!
//! Two redundant root images live at fixed byte offsets inside one base
//! partition. The U-Boot environment on the same partition carries
//! `BOOT_ORDER` and the per-slot attempt counters; the pre-boot step
//! burns one attempt and persists it before anything gets mounted, so a
//! crash mid-boot can never inflate the remaining count.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;

use super::ubootenv::{UbootEnv, ENV_DEFAULT_SIZE};
use crate::kprintln;
use crate::storage::{BlockDevice, BlockDevs};
use crate::util::{KError, KResult};

/// Boot slot identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn as_char(&self) -> char {
        match self {
            Slot::A => 'A',
            Slot::B => 'B',
        }
    }

    /// Label suffix used by slot-specific extlinux entries.
    pub fn suffix(&self) -> &'static str {
        match self {
            Slot::A => "_A",
            Slot::B => "_B",
        }
    }

    pub fn other(&self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    pub fn from_char(c: char) -> Option<Slot> {
        match c {
            'A' => Some(Slot::A),
            'B' => Some(Slot::B),
            _ => None,
        }
    }

    /// Env variable holding this slot's attempt counter.
    pub fn var_name(&self) -> &'static str {
        match self {
            Slot::A => "BOOT_A_LEFT",
            Slot::B => "BOOT_B_LEFT",
        }
    }
}

struct AbInner {
    env: UbootEnv,
    /// Resolved base device name (post name-translation).
    base_device: String,
    env_offset: u64,
    current_slot: Slot,
    slot_a_offset: u64,
    slot_b_offset: u64,
}

/// A/B boot state handle, threaded through the dispatcher.
pub struct AbBoot {
    inner: Option<AbInner>,
}

impl AbBoot {
    pub const fn new() -> Self {
        Self { inner: None }
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.is_some()
    }

    /// Initializes A/B boot from the U-Boot environment on `partition`.
    ///
    /// A second call on an initialized handle is a no-op and preserves
    /// the loaded state.
    pub fn init(
        &mut self,
        devs: &BlockDevs,
        partition: &str,
        offset: u64,
        size: usize,
    ) -> KResult<()> {
        if self.inner.is_some() {
            kprintln!("ab: already initialized");
            return Ok(());
        }

        let size = if size == 0 { ENV_DEFAULT_SIZE } else { size };

        kprintln!(
            "ab: initializing A/B boot from '{}' at offset {:#x} (size: {:#x})",
            partition,
            offset,
            size
        );

        let dev = match resolve_base_device(devs, partition) {
            Some(dev) => dev,
            None => {
                kprintln!("ab: failed to resolve base device '{}'", partition);
                return Err(KError::NotFound);
            }
        };

        let env = UbootEnv::init(dev.as_ref(), offset, size)?;
        let current_slot = env.boot_slot();

        self.inner = Some(AbInner {
            env,
            base_device: dev.name().to_string(),
            env_offset: offset,
            current_slot,
            slot_a_offset: 0,
            slot_b_offset: 0,
        });

        kprintln!("ab: initialized - current slot: {}", current_slot.as_char());
        Ok(())
    }

    /// Sets the byte offsets where the slot filesystems begin.
    pub fn set_offsets(&mut self, offset_a: u64, offset_b: u64) {
        if let Some(st) = &mut self.inner {
            st.slot_a_offset = offset_a;
            st.slot_b_offset = offset_b;
            kprintln!(
                "ab: slot offsets: A={:#x}, B={:#x}",
                offset_a,
                offset_b
            );
        }
    }

    /// Current boot slot. Defaults to `A` when A/B is not configured so
    /// plain extlinux labels keep working.
    pub fn current_slot(&self) -> Slot {
        match &self.inner {
            Some(st) => st.current_slot,
            None => Slot::A,
        }
    }

    /// Resolved base device name, when initialized.
    pub fn base_device(&self) -> Option<&str> {
        self.inner.as_ref().map(|st| st.base_device.as_str())
    }

    /// Byte offset of the current slot's filesystem.
    pub fn slot_offset(&self) -> Option<u64> {
        let st = self.inner.as_ref()?;
        let offset = match st.current_slot {
            Slot::A => st.slot_a_offset,
            Slot::B => st.slot_b_offset,
        };
        (offset > 0).then_some(offset)
    }

    pub fn env(&self) -> Option<&UbootEnv> {
        self.inner.as_ref().map(|st| &st.env)
    }

    /// Pre-boot step: burn one attempt on the current slot, falling over
    /// to the next slot when exhausted, then persist the environment.
    /// The save is the commit point of the "attempt made" decision.
    pub fn pre_boot(&mut self, devs: &BlockDevs) -> KResult<()> {
        let st = match &mut self.inner {
            Some(st) => st,
            None => return Ok(()),
        };

        kprintln!(
            "ab: pre-boot: attempting to boot slot {}",
            st.current_slot.as_char()
        );

        if !st.env.decrement_boot_left(st.current_slot)? {
            match st.env.next_slot(st.current_slot) {
                Some(next) => {
                    kprintln!(
                        "ab: slot {} exhausted, switching to slot {}",
                        st.current_slot.as_char(),
                        next.as_char()
                    );
                    st.current_slot = next;
                    st.env.decrement_boot_left(next)?;
                }
                None => {
                    kprintln!(
                        "ab: all boot slots exhausted! attempting slot {} anyway",
                        st.current_slot.as_char()
                    );
                }
            }
        }

        let dev = devs.open(&st.base_device).ok_or(KError::NotFound)?;
        st.env.save(dev.as_ref(), st.env_offset)
    }
}

/// Resolves a configured base device name to a registered device.
///
/// Policies, first hit wins: exact name; Linux `mmcblkXpN` translated to
/// the internal wrapper naming `wrp0p(N-1)`; GPT label match.
pub fn resolve_base_device(devs: &BlockDevs, name: &str) -> Option<Arc<dyn BlockDevice>> {
    if let Some(dev) = devs.open(name) {
        return Some(dev);
    }

    if let Some(translated) = translate_mmcblk(name) {
        if let Some(dev) = devs.open(&translated) {
            kprintln!("ab: resolved '{}' as '{}'", name, translated);
            return Some(dev);
        }
    }

    if let Some(dev) = devs.by_label(name) {
        kprintln!("ab: resolved '{}' by GPT label as '{}'", name, dev.name());
        return Some(dev);
    }

    None
}

/// `mmcblkXpN` -> `wrp0pM` with `M = N - 1` (partition numbers are
/// 1-based in the Linux naming, 0-based in the wrapper naming).
fn translate_mmcblk(name: &str) -> Option<String> {
    let rest = name.strip_prefix("mmcblk")?;
    let p = rest.find('p')?;
    let (disk, part) = rest.split_at(p);
    if disk.is_empty() || !disk.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n: u32 = part[1..].parse().ok()?;
    if n == 0 {
        return None;
    }
    Some(format!("wrp0p{}", n - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RamDisk;

    const ENV_OFF: u64 = 0x1000;
    const ENV_SIZE: usize = 0x400;

    fn devs_with_base() -> BlockDevs {
        let devs = BlockDevs::new();
        let disk = RamDisk::with_label("wrp0p19", "userdata", 512, 256);
        disk.fill(0xFF);
        devs.register(Arc::new(disk)).unwrap();
        devs
    }

    #[test]
    fn translate_linux_partition_names() {
        assert_eq!(translate_mmcblk("mmcblk0p20").as_deref(), Some("wrp0p19"));
        assert_eq!(translate_mmcblk("mmcblk1p1").as_deref(), Some("wrp0p0"));
        assert_eq!(translate_mmcblk("mmcblk0p0"), None);
        assert_eq!(translate_mmcblk("sda1"), None);
        assert_eq!(translate_mmcblk("mmcblkp2"), None);
    }

    #[test]
    fn resolve_tries_name_translation_and_label() {
        let devs = devs_with_base();

        // Exact name
        assert!(resolve_base_device(&devs, "wrp0p19").is_some());
        // mmcblk translation
        assert_eq!(
            resolve_base_device(&devs, "mmcblk0p20").unwrap().name(),
            "wrp0p19"
        );
        // GPT label
        assert_eq!(
            resolve_base_device(&devs, "userdata").unwrap().name(),
            "wrp0p19"
        );
        assert!(resolve_base_device(&devs, "nothere").is_none());
    }

    #[test]
    fn init_is_idempotent() {
        let devs = devs_with_base();
        let mut ab = AbBoot::new();
        ab.init(&devs, "mmcblk0p20", ENV_OFF, ENV_SIZE).unwrap();
        ab.set_offsets(0x0010_0000, 0x0410_0000);
        ab.pre_boot(&devs).unwrap();
        assert_eq!(ab.env().unwrap().boot_left(Slot::A), 2);

        // Second init keeps the mutated state.
        ab.init(&devs, "mmcblk0p20", ENV_OFF, ENV_SIZE).unwrap();
        assert_eq!(ab.env().unwrap().boot_left(Slot::A), 2);
        assert_eq!(ab.slot_offset(), Some(0x0010_0000));
    }

    #[test]
    fn alternation_after_exhaustion() {
        let devs = devs_with_base();
        let mut ab = AbBoot::new();
        ab.init(&devs, "wrp0p19", ENV_OFF, ENV_SIZE).unwrap();
        ab.set_offsets(0x0010_0000, 0x0410_0000);

        // Three attempts on A...
        for left in [2, 1, 0] {
            assert_eq!(ab.current_slot(), Slot::A);
            ab.pre_boot(&devs).unwrap();
            assert_eq!(ab.env().unwrap().boot_left(Slot::A), left);
        }

        // ...fourth attempt falls over to B and burns one of its tries.
        assert_eq!(ab.current_slot(), Slot::A);
        ab.pre_boot(&devs).unwrap();
        assert_eq!(ab.current_slot(), Slot::B);
        assert_eq!(ab.env().unwrap().boot_left(Slot::B), 2);
        assert_eq!(ab.slot_offset(), Some(0x0410_0000));
    }

    #[test]
    fn all_exhausted_keeps_current_slot() {
        let devs = devs_with_base();
        let mut ab = AbBoot::new();
        ab.init(&devs, "wrp0p19", ENV_OFF, ENV_SIZE).unwrap();

        for _ in 0..6 {
            ab.pre_boot(&devs).unwrap();
        }
        assert_eq!(ab.env().unwrap().boot_left(Slot::A), 0);
        assert_eq!(ab.env().unwrap().boot_left(Slot::B), 0);

        // Both slots burned out: the current slot is retained as a last
        // resort and nothing underflows.
        let before = ab.current_slot();
        ab.pre_boot(&devs).unwrap();
        assert_eq!(ab.current_slot(), before);
        assert_eq!(ab.env().unwrap().boot_left(Slot::A), 0);
        assert_eq!(ab.env().unwrap().boot_left(Slot::B), 0);
    }

    #[test]
    fn counter_persisted_before_returning() {
        let devs = devs_with_base();
        let mut ab = AbBoot::new();
        ab.init(&devs, "wrp0p19", ENV_OFF, ENV_SIZE).unwrap();
        ab.pre_boot(&devs).unwrap();
        assert!(!ab.env().unwrap().is_dirty());

        // The on-device image already carries the decremented counter.
        let dev = devs.open("wrp0p19").unwrap();
        let env = UbootEnv::init(dev.as_ref(), ENV_OFF, ENV_SIZE).unwrap();
        assert_eq!(env.boot_left(Slot::A), 2);
    }

    #[test]
    fn uninitialized_handle_defaults() {
        let ab = AbBoot::new();
        assert!(!ab.is_initialized());
        assert_eq!(ab.current_slot(), Slot::A);
        assert_eq!(ab.base_device(), None);
        assert_eq!(ab.slot_offset(), None);
    }
}
