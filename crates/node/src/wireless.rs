//! Wireless signal level for the `signalQuality` telemetry field.

const PROC_WIRELESS: &str = "/proc/net/wireless";

/// Signal level in dBm for `iface`, or 0 when the interface is missing or
/// the kernel does not expose wireless stats (wired boards, containers).
pub fn signal_quality(iface: &str) -> i32 {
    std::fs::read_to_string(PROC_WIRELESS)
        .ok()
        .and_then(|contents| parse_level(&contents, iface))
        .unwrap_or(0)
}

/// Pull the `level` column for `iface` out of `/proc/net/wireless`.
fn parse_level(contents: &str, iface: &str) -> Option<i32> {
    contents.lines().find_map(|line| {
        let (name, rest) = line.trim_start().split_once(':')?;
        if name != iface {
            return None;
        }
        // status, link, level, noise, ...
        let level = rest.split_whitespace().nth(2)?;
        let dbm: f64 = level.trim_end_matches('.').parse().ok()?;
        Some(dbm.round() as i32)
    })
}
