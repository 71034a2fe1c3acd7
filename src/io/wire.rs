//! Station line protocol
//!
//! Each line is a UTF-8 JSON array of reading objects. Blank lines and a bare
//! `null` carry no readings. Anything else that fails to parse is rejected as
//! a whole; callers log it and keep the connection open.

use crate::domain::types::Reading;

/// Parse one line into its readings
pub fn parse_line(line: &str) -> Result<Vec<Reading>, serde_json::Error> {
    let line = line.trim_start_matches('\u{feff}').trim();
    if line.is_empty() {
        return Ok(Vec::new());
    }
    let readings: Option<Vec<Reading>> = serde_json::from_str(line)?;
    Ok(readings.unwrap_or_default())
}
