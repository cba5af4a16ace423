use std::fmt;
use std::future::Future;
use std::pin::Pin;

use futures::stream::BoxStream;
use snafu::Snafu;

/// Speaker role as seen by a response source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Conversation context handed to a source when a reply is requested.
///
/// The last message is the user turn being answered.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Prompt {
    pub messages: Vec<PromptMessage>,
}

impl Prompt {
    pub fn new(messages: Vec<PromptMessage>) -> Self {
        Self { messages }
    }

    /// Prompt consisting of a single user turn.
    pub fn from_user_text(text: impl Into<String>) -> Self {
        Self::new(vec![PromptMessage::new(Role::User, text)])
    }

    pub fn latest_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.as_str())
    }
}

/// Reply content produced by a source.
pub enum ResponseBody {
    /// Whole reply known up front; the consumer paces its reveal.
    Text(String),
    /// Reply arriving incrementally as text fragments.
    Tokens(BoxStream<'static, SourceResult<String>>),
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => formatter.debug_tuple("Text").field(text).finish(),
            Self::Tokens(_) => formatter.write_str("Tokens(..)"),
        }
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type SourceResult<T> = Result<T, SourceError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SourceError {
    #[snafu(display("response source '{source_id}' has no templates to choose from"))]
    EmptyTemplatePool {
        stage: &'static str,
        source_id: String,
    },
    #[snafu(display("response source kind '{kind}' is not supported"))]
    UnsupportedSource { stage: &'static str, kind: String },
    #[snafu(display("response stream failed on `{stage}`: {message}"))]
    StreamFailed {
        stage: &'static str,
        message: String,
    },
}

/// Capability that turns a prompt into reply content.
pub trait ResponseSource: Send + Sync {
    fn id(&self) -> &str;
    fn respond<'a>(&'a self, prompt: &'a Prompt) -> BoxFuture<'a, SourceResult<ResponseBody>>;
}
