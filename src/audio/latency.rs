//! Underflow-driven latency growth
//!
//! Short bursts of underflow are tolerated. Once `threshold` underflows have
//! accumulated since the last adjustment, the target latency grows by
//! `growth_numerator / growth_denominator` and the stream's buffer
//! attributes are recomputed. Growth stops below the ceiling: a step that
//! would cross it is never applied, and further underflows are only counted.
//!
//! With the default policy the latency walks
//!
//! ```text
//! 20000 -> 30000 -> 45000 -> 67500 -> ... -> 1153297 -> 1729945 (saturated)
//! ```

use serde::{Deserialize, Serialize};

use crate::audio::format::SampleSpec;

/// Sentinel for buffer attribute fields left to the server's default
pub const ATTR_UNSET: u32 = u32::MAX;

/// Server-side buffer attributes of a playback stream, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferAttr {
    /// Maximum buffer length
    pub maxlength: u32,
    /// Target buffer length
    pub tlength: u32,
    /// Bytes that must be buffered before playback starts
    pub prebuf: u32,
    /// Minimum request size
    pub minreq: u32,
    /// Fragment size (capture only)
    pub fragsize: u32,
}

impl BufferAttr {
    /// Attributes for a playback stream targeting `latency_usec`
    ///
    /// `prebuf` and `fragsize` stay unset: the stream is playback-only and
    /// the server's defaults apply.
    pub fn for_latency(latency_usec: u64, spec: &SampleSpec) -> Self {
        let length = byte_len(latency_usec, spec);
        Self {
            maxlength: length,
            tlength: length,
            prebuf: ATTR_UNSET,
            minreq: byte_len(0, spec),
            fragsize: ATTR_UNSET,
        }
    }

    /// Recompute the length fields for a new latency, keeping the rest
    pub fn retarget(&mut self, latency_usec: u64, spec: &SampleSpec) {
        let length = byte_len(latency_usec, spec);
        self.maxlength = length;
        self.tlength = length;
    }
}

fn byte_len(usec: u64, spec: &SampleSpec) -> u32 {
    u32::try_from(spec.usec_to_bytes(usec)).unwrap_or(ATTR_UNSET - 1)
}

/// Parameters of the latency growth policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyPolicy {
    /// Starting latency in microseconds
    pub initial_usec: u64,
    /// Ceiling in microseconds
    pub max_usec: u64,
    /// Underflows since the last adjustment that trigger growth
    pub threshold: u32,
    /// Growth factor numerator
    pub growth_numerator: u64,
    /// Growth factor denominator
    pub growth_denominator: u64,
}

impl Default for LatencyPolicy {
    fn default() -> Self {
        Self {
            initial_usec: crate::DEFAULT_LATENCY_USEC,
            max_usec: crate::MAX_LATENCY_USEC,
            threshold: crate::UNDERFLOW_THRESHOLD,
            growth_numerator: 3,
            growth_denominator: 2,
        }
    }
}

impl LatencyPolicy {
    /// Whether the policy can make progress
    pub fn is_valid(&self) -> bool {
        self.initial_usec > 0
            && self.initial_usec <= self.max_usec
            && self.threshold > 0
            && self.growth_denominator > 0
            && self.growth_numerator > self.growth_denominator
    }

    /// Next latency after one growth step, or None if it would cross the ceiling
    pub fn grow(&self, current_usec: u64) -> Option<u64> {
        let next = current_usec.checked_mul(self.growth_numerator)? / self.growth_denominator;
        (next > current_usec && next <= self.max_usec).then_some(next)
    }
}

/// What a single underflow did to the latency state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnderflowOutcome {
    /// Counted, below the threshold
    Counted { count: u32 },
    /// Threshold reached and latency increased; counter reset
    Increased { from_usec: u64, to_usec: u64 },
    /// Threshold reached but the ceiling blocks further growth
    Saturated { count: u32 },
}

/// Latency state of one playback stream
#[derive(Debug, Clone)]
pub struct LatencyController {
    policy: LatencyPolicy,
    current_usec: u64,
    underflow_count: u32,
    adjustments: u32,
}

impl LatencyController {
    pub fn new(policy: LatencyPolicy) -> Self {
        Self {
            current_usec: policy.initial_usec,
            policy,
            underflow_count: 0,
            adjustments: 0,
        }
    }

    /// Current target latency in microseconds
    pub fn current_usec(&self) -> u64 {
        self.current_usec
    }

    /// Underflows since the last latency increase
    pub fn underflow_count(&self) -> u32 {
        self.underflow_count
    }

    /// Number of latency increases so far
    pub fn adjustments(&self) -> u32 {
        self.adjustments
    }

    /// Whether no further growth is possible
    pub fn is_saturated(&self) -> bool {
        self.policy.grow(self.current_usec).is_none()
    }

    pub fn policy(&self) -> &LatencyPolicy {
        &self.policy
    }

    /// Initial buffer attributes for a stream with `spec`
    pub fn buffer_attr(&self, spec: &SampleSpec) -> BufferAttr {
        BufferAttr::for_latency(self.current_usec, spec)
    }

    /// Record one underflow and apply the growth policy
    pub fn on_underflow(&mut self) -> UnderflowOutcome {
        self.underflow_count = self.underflow_count.saturating_add(1);

        if self.underflow_count < self.policy.threshold || self.current_usec >= self.policy.max_usec
        {
            return self.pending();
        }

        match self.policy.grow(self.current_usec) {
            Some(next) => {
                let from_usec = self.current_usec;
                self.current_usec = next;
                self.underflow_count = 0;
                self.adjustments += 1;
                UnderflowOutcome::Increased {
                    from_usec,
                    to_usec: next,
                }
            }
            None => UnderflowOutcome::Saturated {
                count: self.underflow_count,
            },
        }
    }

    fn pending(&self) -> UnderflowOutcome {
        if self.underflow_count >= self.policy.threshold {
            UnderflowOutcome::Saturated {
                count: self.underflow_count,
            }
        } else {
            UnderflowOutcome::Counted {
                count: self.underflow_count,
            }
        }
    }
}

impl Default for LatencyController {
    fn default() -> Self {
        Self::new(LatencyPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn underflows(controller: &mut LatencyController, n: usize) -> Vec<UnderflowOutcome> {
        (0..n).map(|_| controller.on_underflow()).collect()
    }

    #[test]
    fn test_initial_attr() {
        let controller = LatencyController::default();
        let attr = controller.buffer_attr(&SampleSpec::default());
        assert_eq!(attr.maxlength, 1764);
        assert_eq!(attr.tlength, 1764);
        assert_eq!(attr.minreq, 0);
        assert_eq!(attr.prebuf, ATTR_UNSET);
        assert_eq!(attr.fragsize, ATTR_UNSET);
    }

    #[test]
    fn test_five_underflows_do_nothing() {
        let mut controller = LatencyController::default();
        let outcomes = underflows(&mut controller, 5);
        for (i, outcome) in outcomes.iter().enumerate() {
            assert_eq!(*outcome, UnderflowOutcome::Counted { count: i as u32 + 1 });
        }
        assert_eq!(controller.current_usec(), 20_000);
        assert_eq!(controller.underflow_count(), 5);
    }

    #[test]
    fn test_sixth_underflow_grows_and_resets() {
        let mut controller = LatencyController::default();
        underflows(&mut controller, 5);
        assert_eq!(
            controller.on_underflow(),
            UnderflowOutcome::Increased {
                from_usec: 20_000,
                to_usec: 30_000
            }
        );
        assert_eq!(controller.underflow_count(), 0);

        underflows(&mut controller, 6);
        assert_eq!(controller.current_usec(), 45_000);
        assert_eq!(controller.adjustments(), 2);
    }

    #[test]
    fn test_saturates_below_ceiling() {
        let mut controller = LatencyController::default();
        let mut previous = controller.current_usec();
        for _ in 0..100 {
            underflows(&mut controller, 6);
            assert!(controller.current_usec() >= previous);
            assert!(controller.current_usec() <= 2_000_000);
            previous = controller.current_usec();
        }
        assert_eq!(controller.current_usec(), 1_729_945);
        assert!(controller.is_saturated());
        assert_eq!(controller.adjustments(), 11);
    }

    #[test]
    fn test_saturated_still_counts() {
        let mut controller = LatencyController::default();
        while !controller.is_saturated() {
            controller.on_underflow();
        }
        let before = controller.underflow_count();
        let outcome = controller.on_underflow();
        assert_eq!(controller.underflow_count(), before + 1);
        assert_eq!(controller.current_usec(), 1_729_945);
        assert!(matches!(
            outcome,
            UnderflowOutcome::Counted { .. } | UnderflowOutcome::Saturated { .. }
        ));
    }

    #[test]
    fn test_at_ceiling_never_grows() {
        let policy = LatencyPolicy {
            initial_usec: 2_000_000,
            ..Default::default()
        };
        let mut controller = LatencyController::new(policy);
        let outcomes = underflows(&mut controller, 20);
        assert!(outcomes
            .iter()
            .all(|o| !matches!(o, UnderflowOutcome::Increased { .. })));
        assert_eq!(controller.current_usec(), 2_000_000);
        assert_eq!(controller.underflow_count(), 20);
    }

    #[test]
    fn test_retarget_keeps_unset_fields() {
        let spec = SampleSpec::default();
        let mut attr = BufferAttr::for_latency(20_000, &spec);
        attr.retarget(30_000, &spec);
        assert_eq!(attr.tlength, 2646);
        assert_eq!(attr.maxlength, 2646);
        assert_eq!(attr.prebuf, ATTR_UNSET);
        assert_eq!(attr.fragsize, ATTR_UNSET);
        assert_eq!(attr.minreq, 0);
    }

    #[test]
    fn test_policy_validation() {
        assert!(LatencyPolicy::default().is_valid());
        let shrinking = LatencyPolicy {
            growth_numerator: 1,
            growth_denominator: 2,
            ..Default::default()
        };
        assert!(!shrinking.is_valid());
        let inverted = LatencyPolicy {
            initial_usec: 3_000_000,
            ..Default::default()
        };
        assert!(!inverted.is_valid());
    }
}
