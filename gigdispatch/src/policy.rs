//! Business policy values that drive dispatch timing and pricing.
//!
//! All of the constructors and configuration functions are `const`, so a policy can be declared
//! as a constant.
//!
//! # Example
//!
//! ```
//! # use gigdispatch::policy::DispatchPolicy;
//! # use std::time::Duration;
//! const POLICY: DispatchPolicy = DispatchPolicy::new()
//!     .with_max_waves(4)
//!     .with_wave_window(Duration::from_secs(20))
//!     .with_base_radius_km(2.5);
//!
//! assert_eq!(POLICY.radius_km(1), 2.5);
//! assert_eq!(POLICY.radius_km(3), 7.5);
//! assert_eq!(POLICY.cancellation_fee(10_000), 2_500);
//! ```
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchPolicy {
    max_waves: u32,
    wave_window: Duration,
    lock_window: Duration,
    base_radius_km: f64,
    candidates_per_wave: usize,
    cancellation_fee_bps: u32,
    dispatch_timeout: Option<Duration>,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchPolicy {
    pub const DEFAULT_MAX_WAVES: u32 = 3;
    pub const DEFAULT_WAVE_WINDOW: Duration = Duration::from_secs(30);
    pub const DEFAULT_LOCK_WINDOW: Duration = Duration::from_secs(90);
    pub const DEFAULT_BASE_RADIUS_KM: f64 = 5.0;
    pub const DEFAULT_CANDIDATES_PER_WAVE: usize = 5;
    /// 25% expressed in basis points.
    pub const DEFAULT_CANCELLATION_FEE_BPS: u32 = 2_500;
    pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(10 * 60);

    pub const fn new() -> Self {
        Self {
            max_waves: Self::DEFAULT_MAX_WAVES,
            wave_window: Self::DEFAULT_WAVE_WINDOW,
            lock_window: Self::DEFAULT_LOCK_WINDOW,
            base_radius_km: Self::DEFAULT_BASE_RADIUS_KM,
            candidates_per_wave: Self::DEFAULT_CANDIDATES_PER_WAVE,
            cancellation_fee_bps: Self::DEFAULT_CANCELLATION_FEE_BPS,
            dispatch_timeout: Some(Self::DEFAULT_DISPATCH_TIMEOUT),
        }
    }

    /// Number of waves to broadcast before the job is marked as failed. At least one wave is
    /// always sent.
    pub const fn with_max_waves(self, max_waves: u32) -> Self {
        Self {
            max_waves: if max_waves == 0 { 1 } else { max_waves },
            ..self
        }
    }

    /// How long each wave stays open for workers to accept.
    pub const fn with_wave_window(self, wave_window: Duration) -> Self {
        Self {
            wave_window,
            ..self
        }
    }

    /// How long the employer has to confirm or reject a worker who locked the job.
    pub const fn with_lock_window(self, lock_window: Duration) -> Self {
        Self {
            lock_window,
            ..self
        }
    }

    /// Search radius of the first wave; wave `n` searches `n` times this radius.
    pub const fn with_base_radius_km(self, base_radius_km: f64) -> Self {
        Self {
            base_radius_km,
            ..self
        }
    }

    /// Candidates pinged in the first wave; wave `n` pings up to `n` times as many.
    pub const fn with_candidates_per_wave(self, candidates_per_wave: usize) -> Self {
        Self {
            candidates_per_wave,
            ..self
        }
    }

    pub const fn with_cancellation_fee_bps(self, cancellation_fee_bps: u32) -> Self {
        Self {
            cancellation_fee_bps,
            ..self
        }
    }

    /// Overall time a job may spend looking for a confirmed worker before it expires. [`None`]
    /// disables expiry.
    pub const fn with_dispatch_timeout(self, dispatch_timeout: Option<Duration>) -> Self {
        Self {
            dispatch_timeout,
            ..self
        }
    }

    pub const fn max_waves(&self) -> u32 {
        self.max_waves
    }

    pub const fn wave_window(&self) -> Duration {
        self.wave_window
    }

    pub const fn lock_window(&self) -> Duration {
        self.lock_window
    }

    pub const fn cancellation_fee_bps(&self) -> u32 {
        self.cancellation_fee_bps
    }

    pub const fn dispatch_timeout(&self) -> Option<Duration> {
        self.dispatch_timeout
    }

    pub fn radius_km(&self, wave: u32) -> f64 {
        self.base_radius_km * f64::from(wave.max(1))
    }

    pub fn candidate_limit(&self, wave: u32) -> usize {
        self.candidates_per_wave
            .saturating_mul(wave.max(1) as usize)
    }

    /// The fee charged for cancelling a job worth `pay`, saturating at [`u64::MAX`].
    pub fn cancellation_fee(&self, pay: u64) -> u64 {
        let fee = u128::from(pay) * u128::from(self.cancellation_fee_bps) / 10_000;
        u64::try_from(fee).unwrap_or(u64::MAX)
    }

    /// When a lock taken at `from` runs out. A window beyond the calendar clamps to its end.
    pub(crate) fn lock_expiry(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        after(from, self.lock_window).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// When a job posted at `from` expires, if ever.
    pub(crate) fn dispatch_expiry(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.dispatch_timeout
            .and_then(|timeout| after(from, timeout))
    }
}

fn after(from: DateTime<Utc>, duration: Duration) -> Option<DateTime<Utc>> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| from.checked_add_signed(delta))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_observed_policy() {
        let policy = DispatchPolicy::default();

        assert_eq!(policy.max_waves(), 3);
        assert_eq!(policy.wave_window(), Duration::from_secs(30));
        assert_eq!(policy.lock_window(), Duration::from_secs(90));
        assert_eq!(policy.cancellation_fee(8_000), 2_000);
    }

    #[test]
    fn waves_escalate_radius_and_candidates() {
        let policy = DispatchPolicy::new()
            .with_base_radius_km(3.0)
            .with_candidates_per_wave(4);

        assert_eq!(policy.radius_km(1), 3.0);
        assert_eq!(policy.radius_km(2), 6.0);
        assert_eq!(policy.candidate_limit(1), 4);
        assert_eq!(policy.candidate_limit(3), 12);
    }

    #[test]
    fn at_least_one_wave() {
        assert_eq!(DispatchPolicy::new().with_max_waves(0).max_waves(), 1);
    }

    #[test]
    fn dispatch_timeout_can_be_disabled() {
        let policy = DispatchPolicy::new().with_dispatch_timeout(None);

        assert_eq!(policy.dispatch_expiry(Utc::now()), None);
    }

    #[test]
    fn deadlines_follow_windows() {
        let now = Utc::now();
        let policy = DispatchPolicy::default();

        assert_eq!(policy.lock_expiry(now), now + TimeDelta::seconds(90));
        assert_eq!(
            policy.dispatch_expiry(now),
            Some(now + TimeDelta::minutes(10))
        );
    }

    #[test]
    fn oversized_windows_do_not_overflow() {
        let now = Utc::now();
        let policy = DispatchPolicy::new()
            .with_lock_window(Duration::MAX)
            .with_dispatch_timeout(Some(Duration::MAX));

        assert_eq!(policy.lock_expiry(now), DateTime::<Utc>::MAX_UTC);
        assert_eq!(policy.dispatch_expiry(now), None);
    }

    #[test]
    fn fee_on_huge_pay_does_not_overflow() {
        assert_eq!(DispatchPolicy::new().cancellation_fee(u64::MAX), u64::MAX / 4);
        assert_eq!(
            DispatchPolicy::new()
                .with_cancellation_fee_bps(u32::MAX)
                .cancellation_fee(u64::MAX),
            u64::MAX
        );
    }
}
