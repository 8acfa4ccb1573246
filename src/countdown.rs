use crate::models::ArrivalSource;

/// Render a countdown such as "Arriving in 5 minutes" or "Scheduled in 2 hrs".
pub fn format(minutes: u64, source: ArrivalSource) -> String {
    let prefix = source.label();

    match minutes {
        0 => format!("{} now", prefix),
        1 => format!("{} in 1 minute", prefix),
        m if m >= 60 => {
            let hours = m / 60;
            let remaining = m % 60;
            let unit = if hours > 1 { "hrs" } else { "hr" };
            if remaining == 0 {
                format!("{} in {} {}", prefix, hours, unit)
            } else {
                format!("{} in {} {} {} min", prefix, hours, unit, remaining)
            }
        }
        m => format!("{} in {} minutes", prefix, m),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ArrivalSource::{Realtime, Scheduled};

    #[test]
    fn test_format_boundaries() {
        assert_eq!(format(0, Realtime), "Arriving now");
        assert_eq!(format(1, Scheduled), "Scheduled in 1 minute");
        assert_eq!(format(61, Realtime), "Arriving in 1 hr 1 min");
        assert_eq!(format(120, Scheduled), "Scheduled in 2 hrs");
    }

    #[test]
    fn test_format_minutes_and_hours() {
        assert_eq!(format(2, Realtime), "Arriving in 2 minutes");
        assert_eq!(format(59, Scheduled), "Scheduled in 59 minutes");
        assert_eq!(format(60, Realtime), "Arriving in 1 hr");
        assert_eq!(format(135, Realtime), "Arriving in 2 hrs 15 min");
        assert_eq!(format(0, Scheduled), "Scheduled now");
    }
}
