//! Two-input completion join
//!
//! A turn completes when both the result marker and the final message have
//! arrived, in either order. With only the result, a bounded grace window
//! starts; when it elapses the turn completes without the message.

/// What the caller should do after feeding the join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStep {
    /// Keep waiting
    Waiting,
    /// Start (or restart) the grace timer
    StartGrace,
    /// Complete the turn now
    Complete,
}

/// Join state for one turn
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionJoin {
    has_result: bool,
    has_message: bool,
}

impl CompletionJoin {
    /// Create an empty join
    pub fn new() -> Self {
        Self::default()
    }

    /// The final message arrived
    pub fn message(&mut self) -> JoinStep {
        self.has_message = true;
        self.step()
    }

    /// The result marker arrived
    pub fn result(&mut self) -> JoinStep {
        self.has_result = true;
        self.step()
    }

    /// The grace window elapsed
    pub fn grace_elapsed(&self) -> JoinStep {
        if self.has_result {
            JoinStep::Complete
        } else {
            JoinStep::Waiting
        }
    }

    fn step(&self) -> JoinStep {
        match (self.has_result, self.has_message) {
            (true, true) => JoinStep::Complete,
            (true, false) => JoinStep::StartGrace,
            _ => JoinStep::Waiting,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_then_result() {
        let mut join = CompletionJoin::new();
        assert_eq!(join.message(), JoinStep::Waiting);
        assert_eq!(join.result(), JoinStep::Complete);
    }

    #[test]
    fn test_result_then_message() {
        let mut join = CompletionJoin::new();
        assert_eq!(join.result(), JoinStep::StartGrace);
        assert_eq!(join.message(), JoinStep::Complete);
    }

    #[test]
    fn test_grace_without_result_keeps_waiting() {
        let mut join = CompletionJoin::new();
        assert_eq!(join.grace_elapsed(), JoinStep::Waiting);
        assert_eq!(join.result(), JoinStep::StartGrace);
        assert_eq!(join.grace_elapsed(), JoinStep::Complete);
    }
}
