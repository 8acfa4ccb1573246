use chrono::{DateTime, Utc};
use chrono_tz::Tz;

/// Source of "now" in the agency's local timezone.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Tz>;
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    tz: Tz,
}

impl SystemClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.tz)
    }
}
