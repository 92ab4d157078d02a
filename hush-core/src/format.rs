/// Compact display of a vote or reply count: `999`, `1.2k`, `3.4M`.
pub fn format_count(count: i64) -> String {
    let magnitude = count.unsigned_abs();
    let sign = if count < 0 { "-" } else { "" };
    if magnitude >= 1_000_000 {
        format!("{sign}{:.1}M", magnitude as f64 / 1_000_000.0)
    } else if magnitude >= 1_000 {
        format!("{sign}{:.1}k", magnitude as f64 / 1_000.0)
    } else {
        count.to_string()
    }
}
