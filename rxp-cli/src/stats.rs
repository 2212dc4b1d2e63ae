//! Connection status display and formatting

use rxp::Connection;
use std::time::Duration;

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format duration in human-readable form
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let minutes = secs / 60;
    let seconds = secs % 60;

    if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}.{:03}s", seconds, duration.subsec_millis())
    }
}

/// Render the send window as `[12 13 . .]`, dots for free slots
pub fn format_window(slots: &[Option<u32>]) -> String {
    let cells: Vec<String> = slots
        .iter()
        .map(|slot| slot.map_or_else(|| ".".to_string(), |seq| seq.to_string()))
        .collect();
    format!("[{}]", cells.join(" "))
}

/// One-line summary of a connection
pub fn connection_summary(connection: &Connection) -> String {
    format!(
        "{} -> {} | {} | window {} {} | buffered {}",
        connection.local_addr(),
        connection.remote_addr(),
        connection.state(),
        connection.window_size(),
        format_window(&connection.send_window()),
        format_bytes(connection.buffered() as u64)
    )
}
