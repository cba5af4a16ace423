use snafu::Snafu;
use vela_source::SourceError;
use vela_storage::{StorageError, StorageErrorKind};

use crate::ids::ConversationId;
use crate::state::TransitionRejection;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("conversation store failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("response source failed on `{stage}`: {source}"))]
    Source {
        stage: &'static str,
        source: SourceError,
    },
    #[snafu(display("send pipeline rejected a transition on `{stage}`: {source}"))]
    Transition {
        stage: &'static str,
        source: TransitionRejection,
    },
    #[snafu(display("conversation '{conversation_id}' was not found"))]
    ConversationNotFound {
        stage: &'static str,
        conversation_id: ConversationId,
    },
    #[snafu(display("no conversation is active for `{stage}`"))]
    NoActiveConversation { stage: &'static str },
}

pub type ChatResult<T> = Result<T, ChatError>;

impl ChatError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Storage { stage, .. }
            | Self::Source { stage, .. }
            | Self::Transition { stage, .. }
            | Self::ConversationNotFound { stage, .. }
            | Self::NoActiveConversation { stage } => *stage,
        }
    }

    /// Store failure class, with missing conversations reported as `NotFound`.
    pub fn storage_kind(&self) -> Option<StorageErrorKind> {
        match self {
            Self::Storage { source, .. } => Some(source.kind()),
            Self::ConversationNotFound { .. } => Some(StorageErrorKind::NotFound),
            _ => None,
        }
    }
}
