//! Accounting window label.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Time window a quota is advertised over.
///
/// The token bucket itself is driven only by capacity and refill rate; the
/// window is carried through configuration and stats so operators can read
/// the limit as "N per minute" and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    /// Per-second accounting
    Second,
    /// Per-minute accounting
    #[default]
    Minute,
    /// Per-hour accounting
    Hour,
    /// Per-day accounting
    Day,
}

impl TimeWindow {
    /// Short label used in stats and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeWindow::Second => "1s",
            TimeWindow::Minute => "1m",
            TimeWindow::Hour => "1h",
            TimeWindow::Day => "24h",
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_window_labels() {
        assert_eq!(TimeWindow::Second.as_str(), "1s");
        assert_eq!(TimeWindow::Minute.as_str(), "1m");
        assert_eq!(TimeWindow::Day.to_string(), "24h");
    }

    #[test]
    fn test_time_window_parses_lowercase() {
        let window: TimeWindow = serde_yaml::from_str("hour").unwrap();
        assert_eq!(window, TimeWindow::Hour);
        assert_eq!(window.to_string(), "1h");
    }

    #[test]
    fn test_default_is_minute() {
        assert_eq!(TimeWindow::default(), TimeWindow::Minute);
    }
}
