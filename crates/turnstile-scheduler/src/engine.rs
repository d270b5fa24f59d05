/// Characters of accumulated text required before the first user-visible
/// update is emitted.
pub const FIRST_UPDATE_CHARS: usize = 5;

/// Minimum wall-clock gap, in milliseconds, between regular emits once the
/// first update has fired.
pub const REGULAR_INTERVAL_MS: i64 = 2000;

/// Accumulated text plus the bookkeeping needed to decide the next emit.
/// Stateless externally: every transition takes `nowMs` explicitly so tests
/// can drive it with synthetic clocks instead of real sleeps.
#[derive(Debug, Clone, Default)]
pub struct SchedulerState {
    accumulated: String,
    has_first_update: bool,
    last_update_at_ms: i64,
    last_emitted_len: usize,
}

impl SchedulerState {
    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }
}

/// A user-visible update: a message edit with the text accumulated so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub text: String,
    pub is_first: bool,
    pub is_final: bool,
}

pub struct StreamScheduler;

impl StreamScheduler {
    /// Fold one upstream text fragment into `state`, returning the next
    /// state and an emit decision, if any, per spec.md's threshold rules.
    pub fn observe(mut state: SchedulerState, delta: &str, now_ms: i64) -> (SchedulerState, Option<Decision>) {
        if delta.is_empty() {
            return (state, None);
        }
        state.accumulated.push_str(delta);
        let len = state.accumulated.chars().count();

        let decision = if !state.has_first_update && len >= FIRST_UPDATE_CHARS {
            state.has_first_update = true;
            state.last_update_at_ms = now_ms;
            state.last_emitted_len = len;
            Some(Decision {
                text: state.accumulated.clone(),
                is_first: true,
                is_final: false,
            })
        } else if state.has_first_update && now_ms - state.last_update_at_ms >= REGULAR_INTERVAL_MS {
            state.last_update_at_ms = now_ms;
            state.last_emitted_len = len;
            Some(Decision {
                text: state.accumulated.clone(),
                is_first: false,
                is_final: false,
            })
        } else {
            None
        };

        (state, decision)
    }

    /// Called once the upstream stream ends. Emits a final update iff the
    /// accumulated text differs from whatever was last sent.
    pub fn finish(state: SchedulerState) -> (SchedulerState, Option<Decision>) {
        let len = state.accumulated.chars().count();
        if len == state.last_emitted_len {
            return (state, None);
        }
        let is_first = !state.has_first_update;
        let mut state = state;
        state.last_emitted_len = len;
        let decision = Decision {
            text: state.accumulated.clone(),
            is_first,
            is_final: true,
        };
        (state, Some(decision))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_emit_before_threshold_reached() {
        let mut state = SchedulerState::default();
        for (i, ch) in "abc".chars().enumerate() {
            let (next, decision) = StreamScheduler::observe(state, &ch.to_string(), 1000 + i as i64);
            state = next;
            assert!(decision.is_none());
        }
    }

    #[test]
    fn emits_first_update_exactly_once_threshold_reached() {
        let state = SchedulerState::default();
        let (state, decision) = StreamScheduler::observe(state, "abcde", 1000);
        let decision = decision.expect("threshold reached, should emit");
        assert!(decision.is_first);
        assert_eq!(decision.text, "abcde");

        let (_, decision) = StreamScheduler::observe(state, "f", 1001);
        assert!(decision.is_none(), "second char shouldn't emit before the interval elapses");
    }

    #[test]
    fn regular_emits_are_spaced_by_interval() {
        let state = SchedulerState::default();
        let (state, _) = StreamScheduler::observe(state, "abcde", 0);
        let (state, decision) = StreamScheduler::observe(state, "f", 1999);
        assert!(decision.is_none());
        let (_, decision) = StreamScheduler::observe(state, "g", 2000);
        let decision = decision.expect("interval elapsed, should emit");
        assert!(!decision.is_first);
        assert_eq!(decision.text, "abcdefg");
    }

    #[test]
    fn finish_emits_only_when_text_changed_since_last_emit() {
        let state = SchedulerState::default();
        let (state, _) = StreamScheduler::observe(state, "abcde", 0);
        let (state, tail_decision) = StreamScheduler::finish(state.clone());
        assert!(tail_decision.is_none(), "nothing new accumulated since the last emit");

        let (state2, _) = StreamScheduler::observe(state, "f", 100);
        let (_, tail_decision) = StreamScheduler::finish(state2);
        let decision = tail_decision.expect("trailing text never flushed");
        assert!(decision.is_final);
        assert_eq!(decision.text, "abcdef");
    }
}
