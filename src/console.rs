//! Console unificado - entrada/saída de caracteres pela serial do host.
//!
//! O bootloader hospedeiro registra a sua UART aqui; os macros `kprint!`
//! e o menu usam o mesmo sink.

#![allow(dead_code)]

use alloc::sync::Arc;
use core::fmt;
use spin::Mutex;

/// Byte-oriented serial console provided by the hosting bootloader.
pub trait Console: Send + Sync {
    /// Non-blocking read. Returns `None` when no input is pending.
    fn getc(&self) -> Option<u8>;

    /// Write a single byte.
    fn putc(&self, b: u8);
}

static CONSOLE: Mutex<Option<Arc<dyn Console>>> = Mutex::new(None);

/// Registra o console global usado pelos macros de log.
pub fn set_console(console: Arc<dyn Console>) {
    *CONSOLE.lock() = Some(console);
}

pub fn console() -> Option<Arc<dyn Console>> {
    CONSOLE.lock().clone()
}

/// Lê um byte de qualquer fonte de input disponível.
pub fn read_byte() -> Option<u8> {
    console().and_then(|c| c.getc())
}

/// Escreve um byte no console ('\n' vira "\r\n").
pub fn write_byte(b: u8) {
    if let Some(c) = console() {
        if b == b'\n' {
            c.putc(b'\r');
        }
        c.putc(b);
    }
}

pub fn write_str(s: &str) {
    for &b in s.as_bytes() {
        write_byte(b);
    }
}

struct SinkWriter;

impl fmt::Write for SinkWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write_str(s);
        Ok(())
    }
}

/// Imprime formatado no console. Sem console registrado, descarta.
pub fn print(args: fmt::Arguments) {
    use fmt::Write;
    let _ = SinkWriter.write_fmt(args);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::vec::Vec;
    use spin::Mutex;

    pub(crate) struct ScriptConsole {
        input: Mutex<Vec<u8>>,
        pub output: Mutex<Vec<u8>>,
    }

    impl ScriptConsole {
        pub fn new(input: &[u8]) -> Self {
            let mut v: Vec<u8> = input.into();
            v.reverse();
            Self {
                input: Mutex::new(v),
                output: Mutex::new(Vec::new()),
            }
        }
    }

    impl Console for ScriptConsole {
        fn getc(&self) -> Option<u8> {
            self.input.lock().pop()
        }

        fn putc(&self, b: u8) {
            self.output.lock().push(b);
        }
    }

    #[test]
    fn script_console_replays_input() {
        let c = ScriptConsole::new(b"ab");
        assert_eq!(c.getc(), Some(b'a'));
        assert_eq!(c.getc(), Some(b'b'));
        assert_eq!(c.getc(), None);
    }
}
