use color_eyre::eyre::Result;

use crate::snapshot::RankedSnapshot;

pub(crate) mod console;
pub(crate) mod web;

/// Output for timer-driven snapshots.
pub(crate) trait Presenter {
    fn present(&mut self, snapshot: &RankedSnapshot) -> Result<()>;
}

const UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

/// Formats a byte count with binary units, e.g. `512 B` or `1.5 KiB`.
pub(crate) fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}
