// Print macros for kernel output

/// Print without newline to the active console sink (SBI console on
/// riscv64, stdout on the host).
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::print::_print(format_args!($($arg)*)));
}

/// Print with newline.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn _print(args: core::fmt::Arguments) {
    use core::fmt::Write;

    struct SbiConsole;

    impl core::fmt::Write for SbiConsole {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            for byte in s.bytes() {
                crate::arch::riscv64::sbi::console_putchar(byte);
            }
            Ok(())
        }
    }

    // Console output is best-effort; a failed write has nowhere to report.
    let _ = SbiConsole.write_fmt(args);
}

#[cfg(not(target_os = "none"))]
pub fn _print(args: core::fmt::Arguments) {
    use std::io::Write;

    let _ = std::io::stdout().write_fmt(args);
}

#[cfg(all(not(target_arch = "riscv64"), target_os = "none"))]
pub fn _print(_args: core::fmt::Arguments) {}
