//! Byte counts rendered for log lines and command output.

const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

/// Render `bytes` with IEC units and at most one decimal, e.g. `1.5 KiB`.
pub fn human_size(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes} B");
    }

    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }

    let text = format!("{value:.1}");
    let text = text.strip_suffix(".0").unwrap_or(&text);
    format!("{text} {}", UNITS[unit])
}
