//! Presence filter: debounces raw samples into confirmed presence changes.
//!
//! A sample either qualifies for a candidate state (present or absent) or
//! disqualifies the run in progress. A candidate is confirmed once it has
//! been seen on `hysteresis_count` consecutive samples **and** the delay for
//! its direction has elapsed since the first sample of the run.
//!
//! Distance samples between the two thresholds qualify for neither state and
//! reset the run, as does a sample that agrees with the confirmed state.

use std::time::Duration;

use crate::error::ValidationError;
use crate::sample::{RawSample, Reading};
use crate::sensor::Presence;
use crate::time::Timestamp;

/// Debounce parameters for one sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresencePolicy {
    /// Distances strictly below this many centimetres are presence candidates.
    pub threshold_presence: u32,
    /// Distances strictly above this many centimetres are absence candidates.
    pub threshold_absence: u32,
    /// Consecutive qualifying samples needed to confirm a change.
    pub hysteresis_count: u32,
    /// Minimum run duration before presence is confirmed.
    pub delay_presence: Duration,
    /// Minimum run duration before absence is confirmed.
    pub delay_absence: Duration,
}

impl PresencePolicy {
    /// Policy for binary detection devices: every report counts, no delays.
    #[must_use]
    pub fn detection() -> Self {
        Self {
            threshold_presence: 0,
            threshold_absence: 0,
            hysteresis_count: 1,
            delay_presence: Duration::ZERO,
            delay_absence: Duration::ZERO,
        }
    }

    /// Policy for distance devices: present below 10 cm, absent above 100 cm,
    /// two consecutive samples.
    #[must_use]
    pub fn distance() -> Self {
        Self {
            threshold_presence: 10,
            threshold_absence: 100,
            hysteresis_count: 2,
            delay_presence: Duration::ZERO,
            delay_absence: Duration::ZERO,
        }
    }

    /// Check that the thresholds are ordered and the hysteresis is positive.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::ThresholdOrder`] or
    /// [`ValidationError::ZeroHysteresis`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.threshold_presence > self.threshold_absence {
            return Err(ValidationError::ThresholdOrder {
                presence: self.threshold_presence,
                absence: self.threshold_absence,
            });
        }
        if self.hysteresis_count == 0 {
            return Err(ValidationError::ZeroHysteresis);
        }
        Ok(())
    }

    fn delay_for(&self, target: Presence) -> Duration {
        match target {
            Presence::Present => self.delay_presence,
            _ => self.delay_absence,
        }
    }

    fn classify(&self, reading: Reading) -> Option<Presence> {
        match reading {
            Reading::Detection(detected) => Some(Presence::from(detected)),
            Reading::Distance(cm) if cm < f64::from(self.threshold_presence) => {
                Some(Presence::Present)
            }
            Reading::Distance(cm) if cm > f64::from(self.threshold_absence) => {
                Some(Presence::Absent)
            }
            Reading::Distance(_) => None,
        }
    }
}

/// Debounce progress of one sensor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceState {
    /// Last confirmed presence.
    pub current: Presence,
    /// State the running candidate is heading to.
    pub candidate: Option<Presence>,
    /// Qualifying samples seen in the current run.
    pub consecutive_matches: u32,
    /// Observation time of the first sample in the current run.
    pub pending_since: Option<Timestamp>,
}

impl PresenceState {
    /// Whether a presence value has ever been confirmed.
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.current != Presence::Unknown
    }

    fn reset_run(&mut self) {
        self.candidate = None;
        self.consecutive_matches = 0;
        self.pending_since = None;
    }
}

/// A confirmed presence transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceChange {
    pub present: bool,
    /// Observation time of the sample that confirmed the change.
    pub confirmed_at: Timestamp,
}

/// Stateful filter applying a [`PresencePolicy`] to a stream of samples.
#[derive(Debug, Clone)]
pub struct PresenceFilter {
    policy: PresencePolicy,
    state: PresenceState,
}

impl PresenceFilter {
    #[must_use]
    pub fn new(policy: PresencePolicy) -> Self {
        Self {
            policy,
            state: PresenceState::default(),
        }
    }

    #[must_use]
    pub fn policy(&self) -> &PresencePolicy {
        &self.policy
    }

    #[must_use]
    pub fn state(&self) -> &PresenceState {
        &self.state
    }

    /// Last confirmed presence.
    #[must_use]
    pub fn current(&self) -> Presence {
        self.state.current
    }

    /// Feed one sample; returns a change only when a transition is confirmed.
    pub fn ingest(&mut self, sample: &RawSample) -> Option<PresenceChange> {
        let Some(target) = self.policy.classify(sample.reading) else {
            self.state.reset_run();
            return None;
        };
        if target == self.state.current {
            self.state.reset_run();
            return None;
        }

        if self.state.candidate != Some(target) {
            self.state.candidate = Some(target);
            self.state.consecutive_matches = 0;
            self.state.pending_since = Some(sample.observed_at);
        }
        self.state.consecutive_matches += 1;

        let since = self.state.pending_since.unwrap_or(sample.observed_at);
        let elapsed = (sample.observed_at - since).to_std().unwrap_or_default();
        if self.state.consecutive_matches < self.policy.hysteresis_count
            || elapsed < self.policy.delay_for(target)
        {
            return None;
        }

        self.state.current = target;
        self.state.reset_run();
        Some(PresenceChange {
            present: target == Presence::Present,
            confirmed_at: sample.observed_at,
        })
    }

    /// Forget the confirmed state and any run in progress.
    pub fn reset(&mut self) {
        self.state = PresenceState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::now;
    use chrono::TimeDelta;

    fn distance(cm: f64, at: Timestamp) -> RawSample {
        RawSample::new("hall", Reading::Distance(cm), at)
    }

    fn detection(present: bool, at: Timestamp) -> RawSample {
        RawSample::new("desk", Reading::Detection(present), at)
    }

    fn policy(hysteresis_count: u32, delay_ms: i64) -> PresencePolicy {
        let delay = Duration::from_millis(u64::try_from(delay_ms).unwrap());
        PresencePolicy {
            threshold_presence: 50,
            threshold_absence: 100,
            hysteresis_count,
            delay_presence: delay,
            delay_absence: delay,
        }
    }

    #[test]
    fn should_emit_first_detection_with_single_hysteresis() {
        let mut filter = PresenceFilter::new(PresencePolicy::detection());
        let change = filter.ingest(&detection(false, now())).unwrap();
        assert!(!change.present);
        assert_eq!(filter.current(), Presence::Absent);
    }

    #[test]
    fn should_not_emit_repeated_state() {
        let mut filter = PresenceFilter::new(PresencePolicy::detection());
        let t0 = now();
        assert!(filter.ingest(&detection(true, t0)).is_some());
        assert!(filter.ingest(&detection(true, t0)).is_none());
        assert!(filter.ingest(&detection(true, t0)).is_none());
    }

    #[test]
    fn should_require_consecutive_qualifying_samples() {
        let mut filter = PresenceFilter::new(policy(3, 0));
        let t0 = now();
        assert!(filter.ingest(&distance(20.0, t0)).is_none());
        assert!(filter.ingest(&distance(20.0, t0)).is_none());
        let change = filter.ingest(&distance(20.0, t0)).unwrap();
        assert!(change.present);
    }

    #[test]
    fn should_reset_run_on_band_sample() {
        let mut filter = PresenceFilter::new(policy(2, 0));
        let t0 = now();
        assert!(filter.ingest(&distance(20.0, t0)).is_none());
        assert!(filter.ingest(&distance(75.0, t0)).is_none());
        assert!(filter.ingest(&distance(20.0, t0)).is_none());
        assert_eq!(filter.state().consecutive_matches, 1);
        assert!(filter.ingest(&distance(20.0, t0)).is_some());
    }

    #[test]
    fn should_reset_run_on_opposite_sample() {
        let mut filter = PresenceFilter::new(policy(2, 0));
        let t0 = now();
        filter.ingest(&distance(20.0, t0));
        filter.ingest(&distance(150.0, t0));
        assert_eq!(filter.state().candidate, Some(Presence::Absent));
        assert_eq!(filter.state().consecutive_matches, 1);
        assert_eq!(filter.current(), Presence::Unknown);
    }

    #[test]
    fn should_wait_for_delay_after_first_qualifying_sample() {
        let mut filter = PresenceFilter::new(policy(1, 500));
        let t0 = now();
        assert!(filter.ingest(&distance(150.0, t0)).is_none());
        let early = t0 + TimeDelta::milliseconds(499);
        assert!(filter.ingest(&distance(150.0, early)).is_none());
        let late = t0 + TimeDelta::milliseconds(500);
        let change = filter.ingest(&distance(150.0, late)).unwrap();
        assert!(!change.present);
        assert_eq!(change.confirmed_at, late);
    }

    #[test]
    fn should_restart_delay_after_disqualifying_sample() {
        let mut filter = PresenceFilter::new(policy(1, 500));
        let t0 = now();
        filter.ingest(&distance(150.0, t0));
        filter.ingest(&distance(75.0, t0 + TimeDelta::milliseconds(300)));
        let t1 = t0 + TimeDelta::milliseconds(600);
        assert!(filter.ingest(&distance(150.0, t1)).is_none());
        assert_eq!(filter.state().pending_since, Some(t1));
        assert!(
            filter
                .ingest(&distance(150.0, t1 + TimeDelta::milliseconds(500)))
                .is_some()
        );
    }

    #[test]
    fn should_need_both_hysteresis_and_delay() {
        let mut filter = PresenceFilter::new(policy(3, 100));
        let t0 = now();
        filter.ingest(&distance(10.0, t0));
        let t1 = t0 + TimeDelta::milliseconds(200);
        assert!(filter.ingest(&distance(10.0, t1)).is_none());
        assert!(filter.ingest(&distance(10.0, t1)).is_some());
    }

    #[test]
    fn should_use_direction_specific_delay() {
        let mut p = policy(1, 0);
        p.delay_presence = Duration::from_secs(10);
        let mut filter = PresenceFilter::new(p);
        let t0 = now();
        assert!(filter.ingest(&distance(10.0, t0)).is_none());
        assert!(filter.ingest(&distance(150.0, t0)).is_some());
    }

    #[test]
    fn should_validate_threshold_order() {
        let mut p = policy(1, 0);
        p.threshold_presence = 200;
        assert!(matches!(
            p.validate(),
            Err(ValidationError::ThresholdOrder { .. })
        ));
    }

    #[test]
    fn should_reject_zero_hysteresis() {
        assert_eq!(policy(0, 0).validate(), Err(ValidationError::ZeroHysteresis));
        assert!(PresencePolicy::distance().validate().is_ok());
    }

    #[test]
    fn should_forget_state_on_reset() {
        let mut filter = PresenceFilter::new(PresencePolicy::detection());
        filter.ingest(&detection(true, now()));
        filter.reset();
        assert!(!filter.state().is_confirmed());
    }
}
