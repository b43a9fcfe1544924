//! Serial console boot menu.
//!
//! VT100 escape sequences keep the updates in place: the header is
//! drawn once, navigation only redraws the two lines that changed. Any
//! terminal emulator (minicom, picocom, screen, PuTTY) works.

#![allow(dead_code)]

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;

use crate::console::Console;
use crate::kprintln;
use crate::platform::{Platform, RebootMode};
use crate::storage::BlockDevs;
use crate::usb::dma::Scratch;
use crate::usb::{ums, Udc};

/// Everything the menu actions need.
pub struct MenuCtx {
    pub console: Arc<dyn Console>,
    pub platform: Arc<dyn Platform>,
    pub devs: Arc<BlockDevs>,
    pub udc: Arc<Udc>,
    pub scratch: Arc<Scratch>,
    /// Partition exported by the "USB Storage" action.
    pub ums_partition: String,
}

enum MenuOutcome {
    /// Leave the menu and resume the boot flow.
    Exit,
    /// Redraw the full screen (the action wrote to the console).
    Redraw,
}

struct MenuOption {
    name: &'static str,
    action: fn(&MenuCtx) -> MenuOutcome,
}

fn opt_reboot(ctx: &MenuCtx) -> MenuOutcome {
    ctx.platform.reboot(RebootMode::Normal);
    MenuOutcome::Redraw
}

fn opt_continue(_ctx: &MenuCtx) -> MenuOutcome {
    MenuOutcome::Exit
}

fn opt_recovery(ctx: &MenuCtx) -> MenuOutcome {
    ctx.platform.reboot(RebootMode::Recovery);
    MenuOutcome::Redraw
}

fn opt_bootloader(ctx: &MenuCtx) -> MenuOutcome {
    ctx.platform.reboot(RebootMode::Bootloader);
    MenuOutcome::Redraw
}

fn opt_ums(ctx: &MenuCtx) -> MenuOutcome {
    kprintln!(
        "menu: entering USB mass storage mode (partition='{}')",
        ctx.ums_partition
    );
    let ret = ums::enter_mode(
        &ctx.ums_partition,
        ctx.devs.clone(),
        ctx.udc.clone(),
        &ctx.scratch,
        ctx.console.clone(),
        ctx.platform.clone(),
    );
    if let Err(e) = ret {
        kprintln!("menu: UMS mode failed: {:?}", e);
        ctx.platform.sleep_ms(2000);
    }
    MenuOutcome::Redraw
}

fn opt_edl(ctx: &MenuCtx) -> MenuOutcome {
    ctx.platform.reboot(RebootMode::Edl);
    MenuOutcome::Redraw
}

fn opt_shutdown(ctx: &MenuCtx) -> MenuOutcome {
    ctx.platform.shutdown();
    MenuOutcome::Redraw
}

static MENU_OPTIONS: &[MenuOption] = &[
    MenuOption { name: "Reboot", action: opt_reboot },
    MenuOption { name: "Continue", action: opt_continue },
    MenuOption { name: "Recovery", action: opt_recovery },
    MenuOption { name: "Bootloader", action: opt_bootloader },
    MenuOption { name: "USB Storage", action: opt_ums },
    MenuOption { name: "EDL", action: opt_edl },
    MenuOption { name: "Shutdown", action: opt_shutdown },
];

const SEPARATOR: &str = "----------------------------------------------";

fn puts(console: &dyn Console, s: &str) {
    for &b in s.as_bytes() {
        console.putc(b);
    }
}

/* VT100 helpers */

fn vt_goto(console: &dyn Console, row: usize, col: usize) {
    puts(console, &format!("\x1b[{};{}H", row, col));
}

fn vt_clear_eol(console: &dyn Console) {
    puts(console, "\x1b[K");
}

fn vt_clear_screen(console: &dyn Console) {
    puts(console, "\x1b[2J\x1b[H");
}

fn vt_hide_cursor(console: &dyn Console) {
    puts(console, "\x1b[?25l");
}

fn vt_show_cursor(console: &dyn Console) {
    puts(console, "\x1b[?25h");
}

/// Draws the static header; returns the first menu row.
fn draw_header(console: &dyn Console) -> usize {
    let mut row = 1;

    vt_clear_screen(console);
    vt_hide_cursor(console);

    vt_goto(console, row, 1);
    puts(console, SEPARATOR);
    row += 1;

    vt_goto(console, row, 1);
    puts(console, "  abboot Boot Menu");
    row += 1;

    vt_goto(console, row, 1);
    puts(console, SEPARATOR);
    row += 1;

    vt_goto(console, row, 1);
    puts(
        console,
        &format!("  Version : {}", env!("CARGO_PKG_VERSION")),
    );
    row += 1;

    vt_goto(console, row, 1);
    puts(console, SEPARATOR);
    row += 1;

    // Blank line before the options.
    row += 1;

    row
}

fn draw_option(console: &dyn Console, start_row: usize, idx: usize, selected: bool) {
    vt_goto(console, start_row + idx, 1);
    vt_clear_eol(console);
    let marker = if selected { '>' } else { ' ' };
    puts(
        console,
        &format!("  {} {}. {}", marker, idx + 1, MENU_OPTIONS[idx].name),
    );
}

fn draw_all_options(console: &dyn Console, start_row: usize, sel: usize) {
    for i in 0..MENU_OPTIONS.len() {
        draw_option(console, start_row, i, i == sel);
    }
}

fn draw_footer(console: &dyn Console, start_row: usize) {
    let mut row = start_row + MENU_OPTIONS.len() + 1;
    vt_goto(console, row, 1);
    puts(console, SEPARATOR);
    row += 1;
    vt_goto(console, row, 1);
    puts(console, "  Arrows/u/d: navigate   Enter: select");
    row += 1;
    vt_goto(console, row, 1);
    puts(console, "  1-9: jump to option    q: quit");
    row += 1;
    vt_goto(console, row, 1);
    puts(console, SEPARATOR);
}

fn getc_blocking(console: &dyn Console, platform: &dyn Platform) -> u8 {
    loop {
        if let Some(b) = console.getc() {
            return b;
        }
        platform.sleep_ms(10);
    }
}

/// Reads the remainder of a VT100 escape sequence with a short timeout
/// per byte; a bare ESC resolves to `None`.
fn read_escape(console: &dyn Console, platform: &dyn Platform) -> Option<u8> {
    let mut next = || {
        for _ in 0..5 {
            if let Some(b) = console.getc() {
                return Some(b);
            }
            platform.sleep_ms(10);
        }
        None
    };

    if next()? != b'[' {
        return None;
    }
    next()
}

/// Interactive serial menu. Returns when the user quits or picks
/// "Continue"; reboot-style actions do not return on real hardware.
pub fn serial_menu(ctx: &MenuCtx) {
    let console = ctx.console.as_ref();
    let platform = ctx.platform.as_ref();
    let mut sel = 0usize;

    let mut start_row = draw_header(console);
    draw_all_options(console, start_row, sel);
    draw_footer(console, start_row);

    loop {
        let c = getc_blocking(console, platform);
        let old_sel = sel;

        match c {
            0x1b => match read_escape(console, platform) {
                Some(b'A') => sel = sel.checked_sub(1).unwrap_or(MENU_OPTIONS.len() - 1),
                Some(b'B') => sel = (sel + 1) % MENU_OPTIONS.len(),
                _ => continue,
            },

            b'u' | b'U' | b'k' => {
                sel = sel.checked_sub(1).unwrap_or(MENU_OPTIONS.len() - 1);
            }

            b'd' | b'D' | b'j' => {
                sel = (sel + 1) % MENU_OPTIONS.len();
            }

            b'\r' | b'\n' => {
                vt_show_cursor(console);
                kprintln!("menu: executing '{}'", MENU_OPTIONS[sel].name);
                match (MENU_OPTIONS[sel].action)(ctx) {
                    MenuOutcome::Exit => return,
                    MenuOutcome::Redraw => {
                        start_row = draw_header(console);
                        draw_all_options(console, start_row, sel);
                        draw_footer(console, start_row);
                        continue;
                    }
                }
            }

            b'q' | b'Q' => {
                vt_show_cursor(console);
                kprintln!("menu: exiting");
                return;
            }

            b'1'..=b'9' => {
                let choice = (c - b'1') as usize;
                if choice >= MENU_OPTIONS.len() {
                    continue;
                }
                sel = choice;
                draw_option(console, start_row, old_sel, false);
                draw_option(console, start_row, sel, true);

                vt_show_cursor(console);
                kprintln!("menu: executing '{}'", MENU_OPTIONS[sel].name);
                match (MENU_OPTIONS[sel].action)(ctx) {
                    MenuOutcome::Exit => return,
                    MenuOutcome::Redraw => {
                        start_row = draw_header(console);
                        draw_all_options(console, start_row, sel);
                        draw_footer(console, start_row);
                        continue;
                    }
                }
            }

            _ => continue, // unknown input
        }

        if old_sel != sel {
            draw_option(console, start_row, old_sel, false);
            draw_option(console, start_row, sel, true);
        }
    }
}

/// Countdown before autoboot. Any keypress diverts into the menu.
///
/// Returns `true` when a key arrived within `secs` seconds.
pub fn countdown_check(console: &dyn Console, platform: &dyn Platform, secs: u32) -> bool {
    if secs == 0 {
        return false;
    }

    puts(console, "\r\n=== abboot Boot Menu ===\r\n");
    puts(
        console,
        &format!(
            "Press any key within {} seconds to enter the boot menu\r\n",
            secs
        ),
    );

    // Drain whatever is sitting in the input buffer.
    while console.getc().is_some() {}

    let mut countdown = secs;
    while countdown > 0 {
        puts(console, &format!("\rBooting in {:2} ...  ", countdown));

        // One second, polling for a keypress every 50 ms.
        for _ in 0..20 {
            if console.getc().is_some() {
                puts(console, "\rKey pressed -- entering boot menu\r\n");
                return true;
            }
            platform.sleep_ms(50);
        }

        countdown -= 1;
    }

    puts(console, "\rNo key pressed -- continuing normal boot   \r\n\r\n");
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::tests::TestPlatform;
    use alloc::vec::Vec;
    use spin::Mutex;

    struct TimedConsole {
        /// `(not_before_ms, byte)` pairs against the fake clock.
        input: Mutex<Vec<(u64, u8)>>,
        platform: Arc<TestPlatform>,
        output: Mutex<Vec<u8>>,
    }

    impl TimedConsole {
        fn new(platform: Arc<TestPlatform>, input: &[(u64, u8)]) -> Self {
            let mut v: Vec<(u64, u8)> = input.into();
            v.reverse();
            Self {
                input: Mutex::new(v),
                platform,
                output: Mutex::new(Vec::new()),
            }
        }
    }

    impl Console for TimedConsole {
        fn getc(&self) -> Option<u8> {
            let mut input = self.input.lock();
            match input.last() {
                Some(&(at, b)) if self.platform.uptime_ms() >= at => {
                    input.pop();
                    Some(b)
                }
                _ => None,
            }
        }

        fn putc(&self, b: u8) {
            self.output.lock().push(b);
        }
    }

    #[test]
    fn countdown_times_out_without_input() {
        let platform = Arc::new(TestPlatform::new());
        let console = TimedConsole::new(platform.clone(), &[]);
        assert!(!countdown_check(&console, platform.as_ref(), 2));

        let out = String::from_utf8(console.output.lock().clone()).unwrap();
        assert!(out.contains("continuing normal boot"));
    }

    #[test]
    fn countdown_triggers_on_keypress() {
        let platform = Arc::new(TestPlatform::new());
        // A key arrives half a (fake) second in.
        let console = TimedConsole::new(platform.clone(), &[(500, b'x')]);
        assert!(countdown_check(&console, platform.as_ref(), 3));
    }

    #[test]
    fn countdown_drains_stale_input() {
        let platform = Arc::new(TestPlatform::new());
        // Already-buffered byte must not trigger the menu.
        let console = TimedConsole::new(platform.clone(), &[(0, b'x')]);
        assert!(!countdown_check(&console, platform.as_ref(), 1));
    }

    #[test]
    fn zero_timeout_disables_the_countdown() {
        let platform = Arc::new(TestPlatform::new());
        let console = TimedConsole::new(platform.clone(), &[(0, b'x')]);
        assert!(!countdown_check(&console, platform.as_ref(), 0));
    }

    use crate::usb::dma::NopDmaOps;
    use crate::usb::{
        EpDir, UdcDeviceDesc, UdcEndpoint, UdcGadget, UdcOps, UdcRequest, REQ_STATUS_CANCELED,
    };
    use crate::util::KResult;

    /// Controller stub for menu paths that never reach USB.
    struct NoUdc;

    impl UdcOps for NoUdc {
        fn init(&self, _device: &UdcDeviceDesc) -> KResult<()> {
            Ok(())
        }
        fn start(&self) -> KResult<()> {
            Ok(())
        }
        fn stop(&self) -> KResult<()> {
            Ok(())
        }
        fn register_gadget(&self, _gadget: &UdcGadget) -> KResult<()> {
            Ok(())
        }
        fn endpoint_alloc(&self, dir: EpDir, max_packet: u16) -> KResult<UdcEndpoint> {
            Ok(UdcEndpoint {
                id: 0,
                dir,
                max_packet,
            })
        }
        fn queue(&self, _ep: &UdcEndpoint, req: &Arc<UdcRequest>) -> KResult<()> {
            req.complete(0, REQ_STATUS_CANCELED);
            Ok(())
        }
    }

    fn menu_ctx(console: Arc<dyn Console>, platform: Arc<TestPlatform>) -> MenuCtx {
        MenuCtx {
            console,
            platform,
            devs: Arc::new(BlockDevs::new()),
            udc: Arc::new(Udc::new("hsusb", Arc::new(NoUdc)).unwrap()),
            scratch: Arc::new(Scratch::from_vec(vec![0u8; 8192], Arc::new(NopDmaOps))),
            ums_partition: String::from("userdata"),
        }
    }

    #[test]
    fn menu_navigate_to_continue_and_exit() {
        let platform = Arc::new(TestPlatform::new());
        // Down to "Continue" (index 1), then Enter.
        let console = Arc::new(TimedConsole::new(platform.clone(), &[(0, b'd'), (0, b'\r')]));
        serial_menu(&menu_ctx(console.clone(), platform));

        let out = String::from_utf8(console.output.lock().clone()).unwrap();
        assert!(out.contains("Continue"));
    }

    #[test]
    fn menu_arrow_keys_navigate() {
        let platform = Arc::new(TestPlatform::new());
        // ESC [ B (down) twice, ESC [ A (up) once, then Enter lands on
        // "Continue".
        let input = [
            (0, 0x1b), (0, b'['), (0, b'B'),
            (0, 0x1b), (0, b'['), (0, b'B'),
            (0, 0x1b), (0, b'['), (0, b'A'),
            (0, b'\r'),
        ];
        let console = Arc::new(TimedConsole::new(platform.clone(), &input));
        serial_menu(&menu_ctx(console, platform));
    }

    #[test]
    fn menu_digit_jump_and_quit() {
        let platform = Arc::new(TestPlatform::new());
        // '2' jumps straight to "Continue" and executes it.
        let console = Arc::new(TimedConsole::new(platform.clone(), &[(0, b'2')]));
        serial_menu(&menu_ctx(console, platform));

        // A bare 'q' leaves the menu without running anything.
        let platform = Arc::new(TestPlatform::new());
        let console = Arc::new(TimedConsole::new(platform.clone(), &[(0, b'q')]));
        serial_menu(&menu_ctx(console, platform));
    }
}
