//! Session log export
//!
//! Renders [`SessionLogEntry`] lists for export-to-file consumers. Payloads
//! are decoded as lossy UTF-8.

use std::io::{self, Write};

use chrono::SecondsFormat;

use super::types::SessionLogEntry;

fn timestamp(entry: &SessionLogEntry) -> String {
    entry.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// One line header per entry followed by the raw payload
pub fn write_plain_text<W: Write>(entries: &[SessionLogEntry], mut writer: W) -> io::Result<()> {
    for entry in entries {
        let data = String::from_utf8_lossy(&entry.data);
        writeln!(
            writer,
            "[{}] {:<6} {}",
            timestamp(entry),
            entry.direction.as_str(),
            data.trim_end_matches(['\r', '\n'])
        )?;
    }
    writer.flush()
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// `timestamp,direction,data` with a header row
pub fn write_csv<W: Write>(entries: &[SessionLogEntry], mut writer: W) -> io::Result<()> {
    writeln!(writer, "timestamp,direction,data")?;
    for entry in entries {
        let data = String::from_utf8_lossy(&entry.data);
        writeln!(
            writer,
            "{},{},{}",
            timestamp(entry),
            entry.direction.as_str(),
            csv_field(&data)
        )?;
    }
    writer.flush()
}
