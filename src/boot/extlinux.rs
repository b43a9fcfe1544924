//! Minimal extlinux.conf parser.
//!
//! Keywords are case-insensitive, tokens are whitespace-separated and
//! `#` starts a comment line. Unknown directives are ignored so configs
//! written for a fuller syslinux keep working.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use super::ab::Slot;

/// Boot descriptor location inside the mounted slot root.
pub const EXTLINUX_PATH: &str = "/extlinux/extlinux.conf";

/// One labeled boot entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootEntry {
    pub label: String,
    pub kernel: Option<String>,
    pub initrd: Option<String>,
    pub fdt: Option<String>,
    pub fdtdir: Option<String>,
    pub fdtoverlays: Vec<String>,
    pub append: Option<String>,
}

impl BootEntry {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtlinuxConf {
    pub default: Option<String>,
    pub entries: Vec<BootEntry>,
}

impl ExtlinuxConf {
    pub fn parse(text: &str) -> ExtlinuxConf {
        let mut conf = ExtlinuxConf::default();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut parts = line.splitn(2, char::is_whitespace);
            let keyword = match parts.next() {
                Some(k) => k.to_lowercase(),
                None => continue,
            };
            let rest = parts.next().unwrap_or("").trim();

            match keyword.as_str() {
                "default" => {
                    conf.default = first_token(rest);
                }
                "label" => {
                    if let Some(name) = first_token(rest) {
                        conf.entries.push(BootEntry::new(&name));
                    }
                }
                _ => {
                    let entry = match conf.entries.last_mut() {
                        Some(e) => e,
                        // Directives before the first label are ignored.
                        None => continue,
                    };
                    match keyword.as_str() {
                        "linux" | "kernel" => entry.kernel = first_token(rest),
                        "initrd" => entry.initrd = first_token(rest),
                        "fdt" | "devicetree" => entry.fdt = first_token(rest),
                        "fdtdir" | "devicetreedir" => entry.fdtdir = first_token(rest),
                        "fdtoverlays" | "devicetree-overlay" => {
                            entry.fdtoverlays =
                                rest.split_whitespace().map(String::from).collect();
                        }
                        "append" => entry.append = Some(rest.to_string()),
                        _ => {} // unknown directive
                    }
                }
            }
        }

        conf
    }

    /// Selects the entry to boot.
    ///
    /// In A/B mode (`slot` present): with a `default <base>` line the
    /// entry named `<base>_<slot>` is required; otherwise the first
    /// label ending in `_<slot>` wins. `None` means no matching entry -
    /// the caller must not fall back to a wrong slot.
    ///
    /// In non-A/B mode the `default` label is booted, or the first
    /// entry when the file names no default.
    pub fn select(&self, slot: Option<Slot>) -> Option<&BootEntry> {
        match slot {
            Some(slot) => {
                if let Some(base) = &self.default {
                    let wanted = format!("{}{}", base, slot.suffix());
                    return self.entries.iter().find(|e| e.label == wanted);
                }
                self.entries.iter().find(|e| e.label.ends_with(slot.suffix()))
            }
            None => {
                if let Some(default) = &self.default {
                    if let Some(entry) = self.entries.iter().find(|e| &e.label == default) {
                        return Some(entry);
                    }
                }
                self.entries.first()
            }
        }
    }
}

fn first_token(rest: &str) -> Option<String> {
    rest.split_whitespace().next().map(String::from)
}
