use crate::Nanos;

/// A monotonic point in time, relative to an arbitrary process-local origin.
///
/// Two `Instant`s are only meaningfully comparable within the same process;
/// nothing here is wall-clock or cross-host comparable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(std::time::Instant);

impl Instant {
    #[must_use]
    pub fn now() -> Self {
        Self(std::time::Instant::now())
    }

    #[must_use]
    pub fn elapsed(self) -> Nanos {
        Nanos::from(self.0.elapsed())
    }

    #[must_use]
    pub fn elapsed_since(self, earlier: Self) -> Nanos {
        Nanos::from(self.0.saturating_duration_since(earlier.0))
    }

    #[must_use]
    pub fn checked_add(self, d: Nanos) -> Option<Self> {
        self.0.checked_add(d.as_duration()).map(Self)
    }

    #[must_use]
    pub fn checked_sub(self, d: Nanos) -> Option<Self> {
        self.0.checked_sub(d.as_duration()).map(Self)
    }
}

impl Default for Instant {
    fn default() -> Self {
        Self::now()
    }
}
