use snafu::Snafu;

use crate::ids::RevealTarget;

/// Send-pipeline lifecycle of a chat session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SendState {
    #[default]
    Ready,
    /// Prompt accepted, waiting for the first reply token.
    Submitted(RevealTarget),
    Streaming(RevealTarget),
    Error {
        target: RevealTarget,
        message: String,
    },
}

/// Transition input for the send pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendTransition {
    Submit(RevealTarget),
    Open(RevealTarget),
    Complete(RevealTarget),
    Fail {
        target: RevealTarget,
        message: String,
    },
    Cancel(RevealTarget),
    Reset,
}

/// Rejection reason for illegal send transitions.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum TransitionRejection {
    #[snafu(display("reveal {active:?} is still active, refusing {attempted:?}"))]
    AlreadyActive {
        active: RevealTarget,
        attempted: RevealTarget,
    },
    #[snafu(display("no reveal is active"))]
    NoActiveReveal,
    #[snafu(display("reveal {attempted:?} does not match active reveal {active:?}"))]
    TargetMismatch {
        active: RevealTarget,
        attempted: RevealTarget,
    },
}

pub type SendTransitionResult = Result<SendState, TransitionRejection>;

impl SendState {
    /// Target of the in-flight reveal, if any.
    pub fn active_target(&self) -> Option<RevealTarget> {
        match self {
            Self::Submitted(target) | Self::Streaming(target) => Some(*target),
            Self::Ready | Self::Error { .. } => None,
        }
    }

    /// True while a new send must be refused.
    pub fn is_busy(&self) -> bool {
        self.active_target().is_some()
    }

    /// True when reveal content for `target` may be shown.
    pub fn accepts_content(&self, target: RevealTarget) -> bool {
        matches!(self, Self::Streaming(active) if *active == target)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Submitted(_) => "submitted",
            Self::Streaming(_) => "streaming",
            Self::Error { .. } => "error",
        }
    }

    /// Applies one transition deterministically.
    ///
    /// `Ready` and `Error` accept a new submission. Every other transition must
    /// name the active reveal exactly.
    pub fn apply(&self, transition: SendTransition) -> SendTransitionResult {
        match transition {
            SendTransition::Submit(target) => self.apply_submit(target),
            SendTransition::Open(target) => self.apply_open(target),
            SendTransition::Complete(target) => self.finish_active(target, Self::Ready),
            SendTransition::Fail { target, message } => {
                self.finish_active(target, Self::Error { target, message })
            }
            SendTransition::Cancel(target) => self.finish_active(target, Self::Ready),
            SendTransition::Reset => Ok(Self::Ready),
        }
    }

    fn apply_submit(&self, target: RevealTarget) -> SendTransitionResult {
        match self.active_target() {
            Some(active) if active == target => Ok(self.clone()),
            Some(active) => Err(TransitionRejection::AlreadyActive {
                active,
                attempted: target,
            }),
            None => Ok(Self::Submitted(target)),
        }
    }

    fn apply_open(&self, target: RevealTarget) -> SendTransitionResult {
        match self {
            Self::Submitted(active) | Self::Streaming(active) if *active == target => {
                Ok(Self::Streaming(target))
            }
            Self::Submitted(active) | Self::Streaming(active) => {
                Err(TransitionRejection::TargetMismatch {
                    active: *active,
                    attempted: target,
                })
            }
            Self::Ready | Self::Error { .. } => Err(TransitionRejection::NoActiveReveal),
        }
    }

    fn finish_active(&self, target: RevealTarget, next: SendState) -> SendTransitionResult {
        match self.active_target() {
            Some(active) if active == target => Ok(next),
            Some(active) => Err(TransitionRejection::TargetMismatch {
                active,
                attempted: target,
            }),
            None => Err(TransitionRejection::NoActiveReveal),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ConversationId, RevealSessionId};

    fn target(session: u64) -> RevealTarget {
        RevealTarget::new(ConversationId::new_v7(), RevealSessionId::new(session))
    }

    #[test]
    fn happy_path_returns_to_ready() {
        let target = target(1);
        let submitted = SendState::Ready
            .apply(SendTransition::Submit(target))
            .expect("submit");
        assert_eq!(submitted, SendState::Submitted(target));
        assert!(submitted.is_busy());
        assert!(!submitted.accepts_content(target));

        let streaming = submitted
            .apply(SendTransition::Open(target))
            .expect("open");
        assert!(streaming.accepts_content(target));

        let done = streaming
            .apply(SendTransition::Complete(target))
            .expect("complete");
        assert_eq!(done, SendState::Ready);
    }

    #[test]
    fn second_submit_is_rejected_while_active() {
        let first = target(1);
        let second = target(2);
        let streaming = SendState::Streaming(first);

        let rejection = streaming
            .apply(SendTransition::Submit(second))
            .expect_err("busy");
        assert_eq!(
            rejection,
            TransitionRejection::AlreadyActive {
                active: first,
                attempted: second,
            }
        );
    }

    #[test]
    fn stale_targets_cannot_finish_the_active_reveal() {
        let active = target(2);
        let stale = RevealTarget::new(active.conversation_id, RevealSessionId::new(1));
        let streaming = SendState::Streaming(active);

        for transition in [
            SendTransition::Open(stale),
            SendTransition::Complete(stale),
            SendTransition::Cancel(stale),
            SendTransition::Fail {
                target: stale,
                message: "late".to_string(),
            },
        ] {
            assert!(matches!(
                streaming.apply(transition),
                Err(TransitionRejection::TargetMismatch { .. })
            ));
        }
    }

    #[test]
    fn failure_is_left_by_reset_or_new_submit() {
        let first = target(1);
        let failed = SendState::Submitted(first)
            .apply(SendTransition::Fail {
                target: first,
                message: "source unavailable".to_string(),
            })
            .expect("fail");
        assert_eq!(failed.label(), "error");
        assert!(!failed.is_busy());
        assert_eq!(
            failed.apply(SendTransition::Complete(first)),
            Err(TransitionRejection::NoActiveReveal)
        );

        assert_eq!(
            failed.apply(SendTransition::Reset).expect("reset"),
            SendState::Ready
        );
        let second = target(2);
        assert_eq!(
            failed.apply(SendTransition::Submit(second)).expect("resubmit"),
            SendState::Submitted(second)
        );
    }
}
