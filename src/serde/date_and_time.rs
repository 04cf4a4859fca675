//! Date-and-time representation used for benchmark timestamps: stored
//! in RFC 3339 format plus a filename-safe rendering (spec.md §3:
//! Benchmark carries "timestamp (both human-readable and
//! filename-safe)").

use std::{fmt::Display, str::FromStr, time::SystemTime};

use chrono::{DateTime, Local};

/// Stored in RFC 3339 format, with local time zone offset -- CAREFUL,
/// if specified as the wrong string in a file, no check is done on
/// deserialization!
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, serde::Serialize, serde::Deserialize)]
pub struct DateTimeWithOffset(String);

pub fn system_time_to_rfc3339(t: SystemTime) -> String {
    let t: DateTime<Local> = DateTime::from(t);
    t.to_rfc3339()
}

impl DateTimeWithOffset {
    pub fn now() -> Self {
        Self(system_time_to_rfc3339(SystemTime::now()))
    }

    pub fn to_datetime(&self) -> DateTime<Local> {
        DateTime::parse_from_rfc3339(&self.0)
            .expect("field is result of to_rfc3339 hence always parseable")
            .with_timezone(&Local)
    }

    /// A name-safe rendering suitable for use as part of a path
    /// component: colons and the `T` separator replaced, offset
    /// dropped.
    pub fn to_filename_safe_string(&self) -> String {
        self.to_datetime().format("%Y-%m-%d_%H-%M-%S").to_string()
    }
}

impl Display for DateTimeWithOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DateTimeWithOffset {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = DateTime::parse_from_rfc3339(s)?;
        Ok(Self(t.to_rfc3339()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_roundtrip() {
        let now = DateTimeWithOffset::now();
        let s = now.to_string();
        let again: DateTimeWithOffset = s.parse().expect("just produced it");
        assert_eq!(now, again);
        let fname = now.to_filename_safe_string();
        assert!(!fname.contains(':'));
    }
}
