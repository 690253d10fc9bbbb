//! Hypervisor logging subsystem
//!
//! Lock-bounded ring-buffer logging that works in a `no_std` environment.
//! The buffer is plain memory so an external debugger or monitoring agent
//! can fetch logs without hypervisor cooperation.
//!
//! * Messages are pushed via the `log!` / `log_warn!` / `log_error!`
//!   macros, which accept standard `format!` syntax.
//! * The ring buffer is 64 KiB and overwrites old data when full.
//! * On x86_64 the bytes can additionally be mirrored to a 16550A UART for
//!   early bring-up; mirroring is off until `enable_uart()` runs, so hosted
//!   tests never execute port I/O.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

const LOG_BUF_SIZE: usize = 64 * 1024;

/// Severity attached to each emitted line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    fn tag(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

struct RingBuffer {
    buf: [u8; LOG_BUF_SIZE],
    pos: usize,
    wrapped: bool,
}

static LOG_RING: Mutex<RingBuffer> = Mutex::new(RingBuffer {
    buf: [0; LOG_BUF_SIZE],
    pos: 0,
    wrapped: false,
});

static UART_ENABLED: AtomicBool = AtomicBool::new(false);

/// UART MMIO base address (legacy COM1).
#[cfg(target_arch = "x86_64")]
const UART_BASE: u16 = 0x3F8;

#[inline(always)]
fn uart_write_byte(byte: u8) {
    #[cfg(target_arch = "x86_64")]
    if UART_ENABLED.load(Ordering::Relaxed) {
        // SAFETY: COM1 data port write, only reachable after enable_uart()
        // on the bare-metal boot path.
        unsafe {
            core::arch::asm!("out dx, al", in("dx") UART_BASE, in("al") byte, options(nomem, nostack, preserves_flags));
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = byte;
}

/// Turn on serial mirroring. Bare-metal boot only.
pub fn enable_uart() {
    UART_ENABLED.store(true, Ordering::Relaxed);
}

impl RingBuffer {
    fn push(&mut self, b: u8) {
        self.buf[self.pos] = b;
        self.pos += 1;
        if self.pos == LOG_BUF_SIZE {
            self.pos = 0;
            self.wrapped = true;
        }
    }
}

struct RingWriter<'a>(&'a mut RingBuffer);

impl Write for RingWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            self.0.push(b);
            uart_write_byte(b);
        }
        Ok(())
    }
}

/// Emit one message at the given level. The core never formats to
/// persistent storage; this sink is the whole logging contract.
pub fn emit(level: LogLevel, args: fmt::Arguments<'_>) {
    let mut ring = LOG_RING.lock();
    let mut w = RingWriter(&mut ring);
    let _ = write!(w, "[{}] ", level.tag());
    let _ = w.write_fmt(args);
    let _ = w.write_str("\r\n");
}

/// Copy the most recent log bytes into `out`, returning the length copied.
pub fn copy_tail(out: &mut [u8]) -> usize {
    let ring = LOG_RING.lock();
    let valid = if ring.wrapped { LOG_BUF_SIZE } else { ring.pos };
    let n = core::cmp::min(out.len(), valid);
    // The n bytes ending at pos, in order.
    for (i, slot) in out[..n].iter_mut().enumerate() {
        let idx = (ring.pos + LOG_BUF_SIZE - n + i) % LOG_BUF_SIZE;
        *slot = ring.buf[idx];
    }
    n
}

#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {
        $crate::log::emit($crate::log::LogLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::log::emit($crate::log::LogLevel::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::log::emit($crate::log::LogLevel::Error, format_args!($($arg)*))
    };
}
