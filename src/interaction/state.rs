use anyhow::{anyhow, Result};

/// Debounce parameters of one interaction, in seconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Timing {
    /// Sustained overlap needed before a key confirms.
    pub min_time: f64,
    /// Absence tolerated before a key resets.
    pub expire_time: f64,
}

impl Timing {
    pub fn new(min_time: f64, expire_time: f64) -> Result<Self> {
        if !min_time.is_finite() || min_time < 0.0 {
            return Err(anyhow!("min_time {} must be a finite value >= 0", min_time));
        }
        if !expire_time.is_finite() || expire_time < 0.0 {
            return Err(anyhow!(
                "expire_time {} must be a finite value >= 0",
                expire_time
            ));
        }
        Ok(Self {
            min_time,
            expire_time,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    Pending,
    Active,
}

/// Externally relevant outcome of one step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Idle -> Pending.
    Started,
    /// Pending -> Active. Publishes ON.
    Confirmed,
    /// Pending -> Idle. Never confirmed, nothing is published.
    Discarded,
    /// Active -> Idle. Publishes OFF.
    Ended,
}

impl Transition {
    /// Whether consumers outside the engine see this transition.
    pub fn is_published(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Ended)
    }
}

/// Hysteresis state machine for one interaction key.
///
/// `first_seen` and `last_seen` are set together on Idle -> Pending, and
/// `first_seen <= last_seen` holds whenever they are set.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct InteractionState {
    pub phase: Phase,
    pub first_seen: Option<f64>,
    pub last_seen: Option<f64>,
}

impl InteractionState {
    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Idle
    }

    /// Advance one tick.
    ///
    /// `observed` says whether the key overlapped during this tick. `now` must
    /// not go backwards between calls for the same key.
    pub fn advance(&mut self, observed: bool, now: f64, timing: &Timing) -> Option<Transition> {
        match self.phase {
            Phase::Idle => {
                if !observed {
                    return None;
                }
                self.phase = Phase::Pending;
                self.first_seen = Some(now);
                self.last_seen = Some(now);
                Some(Transition::Started)
            }
            Phase::Pending => {
                if observed {
                    self.last_seen = Some(now);
                    let first_seen = self.first_seen.unwrap_or(now);
                    if now - first_seen >= timing.min_time {
                        self.phase = Phase::Active;
                        return Some(Transition::Confirmed);
                    }
                    None
                } else if self.expired(now, timing) {
                    self.reset();
                    Some(Transition::Discarded)
                } else {
                    None
                }
            }
            Phase::Active => {
                if observed {
                    self.last_seen = Some(now);
                    None
                } else if self.expired(now, timing) {
                    self.reset();
                    Some(Transition::Ended)
                } else {
                    None
                }
            }
        }
    }

    fn expired(&self, now: f64, timing: &Timing) -> bool {
        match self.last_seen {
            Some(last_seen) => now - last_seen > timing.expire_time,
            None => true,
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing() -> Timing {
        Timing::new(6.0, 4.0).expect("timing")
    }

    #[test]
    fn idle_ignores_absence() {
        let mut state = InteractionState::default();
        assert_eq!(state.advance(false, 0.0, &timing()), None);
        assert!(state.is_idle());
        assert_eq!(state.first_seen, None);
    }

    #[test]
    fn first_observation_starts_pending() {
        let mut state = InteractionState::default();
        assert_eq!(state.advance(true, 10.0, &timing()), Some(Transition::Started));
        assert_eq!(state.phase, Phase::Pending);
        assert_eq!(state.first_seen, Some(10.0));
        assert_eq!(state.last_seen, Some(10.0));
    }

    #[test]
    fn confirms_once_min_time_reached() {
        let mut state = InteractionState::default();
        let t = timing();
        state.advance(true, 0.0, &t);
        assert_eq!(state.advance(true, 5.9, &t), None);
        assert_eq!(state.advance(true, 6.0, &t), Some(Transition::Confirmed));
        assert_eq!(state.phase, Phase::Active);
        // Staying observed does not confirm again.
        assert_eq!(state.advance(true, 7.0, &t), None);
        assert_eq!(state.last_seen, Some(7.0));
    }

    #[test]
    fn zero_min_time_confirms_on_second_observation() {
        let mut state = InteractionState::default();
        let t = Timing::new(0.0, 1.0).expect("timing");
        assert_eq!(state.advance(true, 3.0, &t), Some(Transition::Started));
        assert_eq!(state.advance(true, 3.0, &t), Some(Transition::Confirmed));
    }

    #[test]
    fn pending_expiry_is_silent_discard() {
        let mut state = InteractionState::default();
        let t = timing();
        state.advance(true, 0.0, &t);
        assert_eq!(state.advance(false, 4.0, &t), None);
        assert_eq!(state.advance(false, 4.1, &t), Some(Transition::Discarded));
        assert!(!Transition::Discarded.is_published());
        assert!(state.is_idle());
        assert_eq!(state.last_seen, None);
    }

    #[test]
    fn active_expiry_ends() {
        let mut state = InteractionState::default();
        let t = timing();
        state.advance(true, 0.0, &t);
        state.advance(true, 6.0, &t);
        assert_eq!(state.advance(false, 10.0, &t), None);
        assert_eq!(state.advance(false, 10.5, &t), Some(Transition::Ended));
        assert!(state.is_idle());
    }

    #[test]
    fn gap_within_expire_time_keeps_accumulating() {
        let mut state = InteractionState::default();
        let t = timing();
        state.advance(true, 0.0, &t);
        assert_eq!(state.advance(false, 3.0, &t), None);
        assert_eq!(state.advance(true, 3.5, &t), None);
        assert_eq!(state.advance(false, 7.0, &t), None);
        assert_eq!(state.advance(true, 7.5, &t), Some(Transition::Confirmed));
        assert_eq!(state.first_seen, Some(0.0));
    }

    #[test]
    fn timing_rejects_invalid_values() {
        assert!(Timing::new(-0.1, 1.0).is_err());
        assert!(Timing::new(1.0, f64::INFINITY).is_err());
        assert!(Timing::new(0.0, 0.0).is_ok());
    }
}
