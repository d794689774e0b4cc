//! Formatting helpers for human-readable byte sizes, speeds and ETAs.

use std::time::Duration;

use crate::progress::Eta;

const UNITS: [&str; 5] = ["KB", "MB", "GB", "TB", "PB"];

/// Formats a byte count with two decimals in binary units, e.g. "1.50 MB".
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

/// Formats a speed in bytes per second, e.g. "1.50 MB/s".
#[must_use]
pub fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec))
}

/// Formats an elapsed time: tenths of a second below one minute
/// ("4.2s"), then zero-padded clock units ("1m 05s", "1h 01m 05s").
#[must_use]
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, secs / 60 % 60, secs % 60);
    match (hours, minutes) {
        (0, 0) => format!("{seconds}.{}s", d.subsec_millis() / 100),
        (0, m) => format!("{m}m {seconds:02}s"),
        (h, m) => format!("{h}h {m:02}m {seconds:02}s"),
    }
}

/// Formats an ETA with its two most significant units: "45s", "1m 5s",
/// "2h 3m", "1d 2h". Unknown renders as "--".
#[must_use]
pub fn format_eta(eta: Eta) -> String {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;

    let Some(d) = eta.as_duration() else {
        return "--".to_string();
    };
    // round up so a sub-second remainder never shows as "0s"
    let secs = d.as_secs().saturating_add(u64::from(d.subsec_nanos() > 0));
    if secs >= DAY {
        format!("{}d {}h", secs / DAY, (secs % DAY) / HOUR)
    } else if secs >= HOUR {
        format!("{}h {}m", secs / HOUR, (secs % HOUR) / MINUTE)
    } else if secs >= MINUTE {
        format!("{}m {}s", secs / MINUTE, secs % MINUTE)
    } else {
        format!("{secs}s")
    }
}
