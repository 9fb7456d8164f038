//! Human-readable byte counts for logs and CLI output.

use std::fmt;

const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

/// Displays a byte count in IEC units, e.g. `1.5 KiB` or `500 MiB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HumanBytes(pub u64);

impl fmt::Display for HumanBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut scaled = self.0 as f64;
        let mut unit = 0;
        while scaled >= 1024.0 && unit + 1 < UNITS.len() {
            scaled /= 1024.0;
            unit += 1;
        }

        if unit == 0 {
            return write!(f, "{} B", self.0);
        }

        let precision = if scaled >= 10.0 { 1 } else { 2 };
        let rendered = format!("{scaled:.precision$}");
        let rendered = rendered.trim_end_matches('0').trim_end_matches('.');
        write!(f, "{rendered} {}", UNITS[unit])
    }
}

/// Megabytes (as configured) to bytes.
pub const fn mebibytes(mb: u64) -> u64 {
    mb.saturating_mul(1024 * 1024)
}
