mod branch;
mod conversations;
pub mod error;
pub mod events;
pub mod ids;
pub mod message;
pub mod reveal;
pub mod session;
pub mod settings;
pub mod state;

pub use error::{ChatError, ChatResult};
pub use events::{Notice, NoticeLevel, SessionUpdate};
pub use ids::{ConversationId, MessageKey, RevealSessionId, RevealTarget, VersionId};
pub use message::{
    ConversationView, Direction, Message, Role, SyncState, TITLE_MAX_CHARS, Version,
    title_from_text,
};
pub use reveal::{
    RevealEvent, RevealHandle, RevealPacing, RevealPayload, RevealRequest, normalize,
    reveal_frames, spawn_reveal, tokenize,
};
pub use session::{ChatSession, RevealState, SendOutcome, SessionConfig};
pub use settings::{RevealSettings, Settings, SettingsError, SettingsStore, SourceSettings};
pub use state::{SendState, SendTransition, TransitionRejection};
