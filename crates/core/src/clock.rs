//! Time source for lifecycle timestamps.
//!
//! The queue never reads the wall clock directly; it asks a [`Clock`]. In
//! production that is the system clock. Tests use a manual clock so liveness
//! lapses can be simulated without sleeping.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

#[derive(Debug)]
enum Source {
    System,
    Manual(RwLock<DateTime<Utc>>),
}

/// Shared, cheaply clonable time source.
#[derive(Debug, Clone)]
pub struct Clock {
    source: Arc<Source>,
}

impl Clock {
    /// Wall-clock time.
    pub fn system() -> Self {
        Self {
            source: Arc::new(Source::System),
        }
    }

    /// A clock frozen at `start` that only moves via [`Clock::advance`] or
    /// [`Clock::set`].
    pub fn manual(start: DateTime<Utc>) -> Self {
        Self {
            source: Arc::new(Source::Manual(RwLock::new(start))),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        match &*self.source {
            Source::System => Utc::now(),
            Source::Manual(at) => match at.read() {
                Ok(guard) => *guard,
                Err(poisoned) => *poisoned.into_inner(),
            },
        }
    }

    /// Move a manual clock forward. No-op for the system clock.
    pub fn advance(&self, by: Duration) {
        if let Source::Manual(at) = &*self.source {
            let mut guard = match at.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard += by;
        }
    }

    /// Pin a manual clock to `to`. No-op for the system clock.
    pub fn set(&self, to: DateTime<Utc>) {
        if let Source::Manual(at) = &*self.source {
            let mut guard = match at.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = to;
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(&*self.source, Source::Manual(_))
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_only_moves_when_told() {
        let start = Utc::now();
        let clock = Clock::manual(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::seconds(31));
        assert_eq!(clock.now(), start + Duration::seconds(31));

        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn clones_share_the_same_time() {
        let clock = Clock::manual(Utc::now());
        let other = clock.clone();
        clock.advance(Duration::seconds(5));
        assert_eq!(clock.now(), other.now());
    }

    #[test]
    fn system_clock_ignores_advance() {
        let clock = Clock::system();
        let before = clock.now();
        clock.advance(Duration::days(365));
        assert!(clock.now() - before < Duration::days(1));
        assert!(!clock.is_manual());
    }
}
