//! Numeric column statistics: sum/min/max/mean/median over a set of
//! `f64` values extracted from one column across a set of runs.
//! Grounds spec §4.10 "Statistics per column ... sum/min/max/mean/
//! median"; structurally descended from the teacher's `Stats` type
//! (which additionally tracked percentile tiles for probe timing
//! data -- not needed here, so dropped).

use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum StatsError {
    #[error("no input values")]
    NoInputs,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stats {
    pub count: usize,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
}

impl Stats {
    pub fn from_values(mut values: Vec<f64>) -> Result<Self, StatsError> {
        if values.is_empty() {
            return Err(StatsError::NoInputs);
        }
        values.sort_by(|a, b| a.partial_cmp(b).expect("non-NaN inputs"));
        let count = values.len();
        let sum: f64 = values.iter().sum();
        let min = values[0];
        let max = values[count - 1];
        let mean = sum / count as f64;
        let median = if count % 2 == 1 {
            values[count / 2]
        } else {
            (values[count / 2 - 1] + values[count / 2]) / 2.0
        };
        Ok(Self {
            count,
            sum,
            min,
            max,
            mean,
            median,
        })
    }
}

impl Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "n={} sum={:.3} min={:.3} max={:.3} mean={:.3} median={:.3}",
            self.count, self.sum, self.min, self.max, self.mean, self.median
        )
    }
}

/// Parse a numeric column value, stripping a trailing unit suffix
/// (e.g. "1.23s" -> 1.23, "204800B" -> 204800.0), per spec §4.10
/// "Numbers are parsed with trailing unit stripping".
pub fn parse_numeric_with_unit(s: &str) -> Option<f64> {
    let s = s.trim();
    let end = s
        .char_indices()
        .find(|&(_, c)| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+' || c == 'e' || c == 'E'))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    s[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_stats_odd() {
        let s = Stats::from_values(vec![1.0, 3.0, 2.0]).unwrap();
        assert_eq!(s.count, 3);
        assert_eq!(s.sum, 6.0);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 3.0);
        assert_eq!(s.mean, 2.0);
        assert_eq!(s.median, 2.0);
    }

    #[test]
    fn t_stats_even() {
        let s = Stats::from_values(vec![4.0, 1.0, 2.0, 3.0]).unwrap();
        assert_eq!(s.median, 2.5);
    }

    #[test]
    fn t_stats_empty() {
        assert_eq!(Stats::from_values(vec![]), Err(StatsError::NoInputs));
    }

    #[test]
    fn t_parse_numeric_with_unit() {
        assert_eq!(parse_numeric_with_unit("1.23s"), Some(1.23));
        assert_eq!(parse_numeric_with_unit("204800B"), Some(204800.0));
        assert_eq!(parse_numeric_with_unit("-3.5"), Some(-3.5));
        assert_eq!(parse_numeric_with_unit("abc"), None);
    }
}
