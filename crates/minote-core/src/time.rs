use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock time in milliseconds since the Unix epoch.
///
/// All timestamps the cloud API exchanges (`ts` query parameters,
/// `createDate`/`modifyDate` fields) are millisecond precision, so the
/// whole system uses one representation.
#[derive(
    ::bincode::Encode,
    ::bincode::Decode,
    ::serde::Serialize,
    ::serde::Deserialize,
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    pub fn now() -> Self {
        Self(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("Time went backwards")
                .as_millis() as u64,
        )
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    pub fn saturating_add(self, d: Duration) -> Self {
        Self(self.0.saturating_add(d.as_millis() as u64))
    }

    pub fn saturating_sub(self, other: Self) -> Duration {
        Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Timestamp> for u64 {
    fn from(value: Timestamp) -> Self {
        value.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_after_epoch() {
        assert!(Timestamp::ZERO < Timestamp::now());
    }

    #[test]
    fn add_and_sub() {
        let t = Timestamp::from(1_000);
        let later = t.saturating_add(Duration::from_millis(500));
        assert_eq!(later.as_millis(), 1_500);
        assert_eq!(later.saturating_sub(t), Duration::from_millis(500));
        assert_eq!(t.saturating_sub(later), Duration::ZERO);
    }
}
