//! Compact port lists used by service templates
//!
//! Format: comma-separated single ports or inclusive dash ranges,
//! e.g. `"2302-2305,27016"`.

use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortListError {
    #[error("Port list is empty")]
    Empty,

    #[error("Invalid port entry '{entry}': {reason}")]
    InvalidEntry { entry: String, reason: String },
}

/// Inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn range(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}

fn parse_port(s: &str) -> Result<u16, String> {
    let port = s
        .trim()
        .parse::<u16>()
        .map_err(|e| format!("Invalid port: {}", e))?;
    if port == 0 {
        return Err("Port 0 is not allowed".to_string());
    }
    Ok(port)
}

impl FromStr for PortRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((start, end)) = s.split_once('-') {
            let start = parse_port(start).map_err(|e| format!("start: {}", e))?;
            let end = parse_port(end).map_err(|e| format!("end: {}", e))?;
            if start > end {
                return Err(format!("Start port {} > end port {}", start, end));
            }
            Ok(PortRange::range(start, end))
        } else {
            Ok(PortRange::single(parse_port(s)?))
        }
    }
}

/// Parse a comma-separated port list, preserving entry order
pub fn parse_port_list(s: &str) -> Result<Vec<PortRange>, PortListError> {
    if s.trim().is_empty() {
        return Err(PortListError::Empty);
    }

    s.split(',')
        .map(|entry| {
            entry
                .parse::<PortRange>()
                .map_err(|reason| PortListError::InvalidEntry {
                    entry: entry.trim().to_string(),
                    reason,
                })
        })
        .collect()
}
