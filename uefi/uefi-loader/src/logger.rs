//! Logging for the loader: mirror every record to the UEFI text console
//! while boot services are alive, and always to the QEMU debug port, which
//! keeps working after `ExitBootServices`.

use core::fmt::Write;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// QEMU's `isa-debugcon` port.
const DEBUG_PORT: u16 = 0xe9;

pub struct UefiLogger {
    max_level: LevelFilter,
    boot_services_available: bool,
}

impl UefiLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self {
            max_level,
            boot_services_available: true,
        }
    }

    /// Call this once during early init.
    #[allow(
        static_mut_refs,
        clippy::missing_errors_doc,
        clippy::missing_panics_doc
    )]
    pub fn init(self) -> Result<&'static mut Self, SetLoggerError> {
        // log::set_logger needs a &'static Log; a static holds the instance.
        static mut LOGGER: Option<UefiLogger> = None;

        unsafe {
            LOGGER = Some(self);
            log::set_logger(LOGGER.as_ref().unwrap() as &'static dyn Log)?;
        }
        log::set_max_level(LevelFilter::Trace);
        unsafe { Ok(LOGGER.as_mut().expect("initialized")) }
    }

    pub const fn exit_boot_services(&mut self) {
        self.boot_services_available = false;
    }
}

impl Log for UefiLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let _ = writeln!(
            DebugPort,
            "[{}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );

        // Mirror to the UEFI console as long as possible.
        if self.boot_services_available {
            uefi::println!(
                "[{}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {
        // no-op for the debug port
    }
}

/// Byte sink on the QEMU debug port. Usable at any time, including after
/// the switch onto the kernel address space (port I/O needs no mapping).
pub struct DebugPort;

impl DebugPort {
    pub fn write_bytes(s: &[u8]) {
        for b in s {
            // SAFETY: port 0xe9 is the QEMU debug console; writing a byte
            // has no memory effects.
            unsafe {
                core::arch::asm!(
                    "out dx, al",
                    in("dx") DEBUG_PORT,
                    in("al") *b,
                    options(nomem, nostack, preserves_flags)
                );
            }
        }
    }
}

impl Write for DebugPort {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        Self::write_bytes(s.as_bytes());
        Ok(())
    }
}
