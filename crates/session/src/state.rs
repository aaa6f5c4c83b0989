//! Session state machine states

/// Per-call session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet started
    Idle,
    /// Quiet, awaiting speech
    Listening,
    /// VAD reports voice, STT accumulating
    UserSpeaking,
    /// LLM invocation in flight
    Thinking,
    /// TTS audio streaming to the room
    Speaking,
    /// A tool call is being dispatched
    ToolRunning,
    /// Teardown initiated
    Ending,
    /// Terminal
    Terminated,
}

impl SessionState {
    /// Whether the state machine may move from `self` to `to`
    ///
    /// `Ending` is reachable from every state; `Terminated` only from
    /// `Ending`.
    pub fn can_transition(self, to: SessionState) -> bool {
        use SessionState::*;
        if self == Terminated {
            return false;
        }
        match (self, to) {
            (_, Ending) => true,
            (Ending, Terminated) => true,
            (Idle, Listening) => true,
            (Listening, UserSpeaking) => true,
            // A turn can end straight out of Listening when STT finalizes
            // after a VAD flap.
            (Listening, Thinking) => true,
            (UserSpeaking, Thinking) => true,
            (Thinking, Speaking) => true,
            (Thinking, ToolRunning) => true,
            // Recovery utterances after an LLM failure.
            (Thinking, Listening) => true,
            (ToolRunning, Thinking) => true,
            (ToolRunning, Speaking) => true,
            (Speaking, Listening) => true,
            (Speaking, ToolRunning) => true,
            // Canned speech (greeting, apologies) starts outside a turn.
            (Listening, Speaking) => true,
            (Idle, Speaking) => true,
            _ => false,
        }
    }

    /// Whether this state is terminal
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Terminated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn test_ending_reachable_from_everywhere() {
        for state in [Idle, Listening, UserSpeaking, Thinking, Speaking, ToolRunning, Ending] {
            assert!(state.can_transition(Ending), "{:?} -> Ending", state);
        }
    }

    #[test]
    fn test_terminated_is_terminal() {
        assert!(!Terminated.can_transition(Ending));
        assert!(!Terminated.can_transition(Listening));
        assert!(Terminated.is_terminal());
    }

    #[test]
    fn test_turn_cycle() {
        assert!(Listening.can_transition(UserSpeaking));
        assert!(UserSpeaking.can_transition(Thinking));
        assert!(Thinking.can_transition(Speaking));
        assert!(Speaking.can_transition(Listening));
    }

    #[test]
    fn test_tool_loop() {
        assert!(Thinking.can_transition(ToolRunning));
        assert!(ToolRunning.can_transition(Thinking));
        assert!(ToolRunning.can_transition(Speaking));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!Speaking.can_transition(Thinking));
        assert!(!Idle.can_transition(Thinking));
        assert!(!Listening.can_transition(ToolRunning));
    }
}
