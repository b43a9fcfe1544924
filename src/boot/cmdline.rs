//! Pass-through keys read from the booted OS's own kernel command line.
//!
//! These live in the extlinux `append` line and tell the bootloader
//! which fixups the OS wants (simple-framebuffer handoff, ramoops
//! carve-out, spin-table handling). They are consumed here, not by the
//! kernel.

use bitflags::bitflags;

bitflags! {
    /// Flags accepted by `lk2nd.pass-simplefb=...`, comma-combined.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SimplefbFlags: u8 {
        const AUTOREFRESH = 1 << 0;
        const XRGB8888    = 1 << 1;
        const RGB565      = 1 << 2;
        const RELOCATE    = 1 << 3;
    }
}

/// Parsed pass-through configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PassFlags {
    /// `lk2nd.pass-simplefb` present; value holds the requested flags.
    pub simplefb: Option<SimplefbFlags>,
    /// `lk2nd.pass-ramoops` present.
    pub ramoops: bool,
    /// `lk2nd.pass-ramoops=zap` requested.
    pub ramoops_zap: bool,
    /// `lk2nd.spin-table=force` present.
    pub spin_table_force: bool,
}

pub fn parse(cmdline: &str) -> PassFlags {
    let mut out = PassFlags::default();

    for token in cmdline.split_whitespace() {
        let (key, value) = match token.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (token, None),
        };

        match key {
            "lk2nd.pass-simplefb" => {
                let mut flags = SimplefbFlags::empty();
                if let Some(value) = value {
                    for flag in value.split(',') {
                        match flag {
                            "autorefresh" => flags |= SimplefbFlags::AUTOREFRESH,
                            "xrgb8888" => flags |= SimplefbFlags::XRGB8888,
                            "rgb565" => flags |= SimplefbFlags::RGB565,
                            "relocate" => flags |= SimplefbFlags::RELOCATE,
                            _ => {} // unknown flags are ignored
                        }
                    }
                }
                out.simplefb = Some(flags);
            }
            "lk2nd.pass-ramoops" => {
                out.ramoops = true;
                out.ramoops_zap = value == Some("zap");
            }
            "lk2nd.spin-table" => {
                if value == Some("force") {
                    out.spin_table_force = true;
                }
            }
            _ => {}
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_keys() {
        let p = parse("root=/dev/sda2 lk2nd.pass-simplefb lk2nd.pass-ramoops quiet");
        assert_eq!(p.simplefb, Some(SimplefbFlags::empty()));
        assert!(p.ramoops);
        assert!(!p.ramoops_zap);
        assert!(!p.spin_table_force);
    }

    #[test]
    fn simplefb_flag_combinations() {
        let p = parse("lk2nd.pass-simplefb=autorefresh,rgb565,relocate");
        let flags = p.simplefb.unwrap();
        assert!(flags.contains(SimplefbFlags::AUTOREFRESH));
        assert!(flags.contains(SimplefbFlags::RGB565));
        assert!(flags.contains(SimplefbFlags::RELOCATE));
        assert!(!flags.contains(SimplefbFlags::XRGB8888));

        // Unknown flags do not poison the known ones.
        let p = parse("lk2nd.pass-simplefb=xrgb8888,bogus");
        assert_eq!(p.simplefb, Some(SimplefbFlags::XRGB8888));
    }

    #[test]
    fn ramoops_zap_and_spin_table() {
        let p = parse("lk2nd.pass-ramoops=zap lk2nd.spin-table=force");
        assert!(p.ramoops && p.ramoops_zap);
        assert!(p.spin_table_force);

        // Other spin-table values do not force.
        assert!(!parse("lk2nd.spin-table=auto").spin_table_force);
    }

    #[test]
    fn absent_keys_default_off() {
        let p = parse("console=ttyMSM0,115200n8 root=PARTLABEL=system");
        assert_eq!(p, PassFlags::default());
    }
}
