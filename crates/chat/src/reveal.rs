use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use vela_source::{Prompt, ResponseBody, ResponseSource, SourceResult};

use crate::ids::RevealTarget;
use crate::state::SendTransition;

/// Splits reply text into display tokens.
///
/// Whitespace runs are separators; tokens never contain whitespace.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_string).collect()
}

/// Final content of a fully revealed reply.
pub fn normalize(text: &str) -> String {
    tokenize(text).join(" ")
}

/// Snapshots a reveal publishes for `text`, in order.
pub fn reveal_frames(text: &str) -> Vec<String> {
    let mut content = String::new();
    tokenize(text)
        .into_iter()
        .map(|token| {
            push_token(&mut content, &token);
            content.clone()
        })
        .collect()
}

fn push_token(content: &mut String, token: &str) {
    if !content.is_empty() {
        content.push(' ');
    }
    content.push_str(token);
}

/// Delay between consecutive token publications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevealPacing {
    Fixed(Duration),
    /// Uniform draw from `min..=max` per token.
    Jitter { min: Duration, max: Duration },
}

impl Default for RevealPacing {
    fn default() -> Self {
        Self::Jitter {
            min: Duration::from_millis(50),
            max: Duration::from_millis(150),
        }
    }
}

impl RevealPacing {
    pub fn jitter(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self::Jitter { min, max }
        } else {
            Self::Jitter { min: max, max: min }
        }
    }

    pub fn next_interval(&self) -> Duration {
        match *self {
            Self::Fixed(interval) => interval,
            Self::Jitter { min, max } if min >= max => min,
            Self::Jitter { min, max } => rand::thread_rng().gen_range(min..=max),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RevealRequest {
    pub target: RevealTarget,
    pub prompt: Prompt,
    /// Wait before asking the source, cancellable.
    pub submit_delay: Duration,
    pub pacing: RevealPacing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevealPayload {
    /// First token is about to be published.
    Opened,
    /// Full content revealed so far.
    Content(String),
    Done(String),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealEvent {
    pub target: RevealTarget,
    pub payload: RevealPayload,
}

impl RevealEvent {
    pub fn new(target: RevealTarget, payload: RevealPayload) -> Self {
        Self { target, payload }
    }

    /// Lifecycle transition carried by this event, if any.
    ///
    /// Content snapshots update the revealed text, not the send state.
    pub fn transition(&self) -> Option<SendTransition> {
        match &self.payload {
            RevealPayload::Opened => Some(SendTransition::Open(self.target)),
            RevealPayload::Content(_) => None,
            RevealPayload::Done(_) => Some(SendTransition::Complete(self.target)),
            RevealPayload::Error(message) => Some(SendTransition::Fail {
                target: self.target,
                message: message.clone(),
            }),
        }
    }
}

/// Owner of a running reveal task. Dropping the handle cancels the reveal.
#[derive(Debug)]
pub struct RevealHandle {
    target: RevealTarget,
    cancel_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RevealHandle {
    pub fn target(&self) -> RevealTarget {
        self.target
    }

    /// Requests cancellation; returns false when already requested or finished.
    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RevealHandle {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// Starts revealing the source's reply to `request.prompt`.
///
/// Must be called from within a tokio runtime. Every event carries
/// `request.target`; after cancellation no further events are sent.
pub fn spawn_reveal(
    source: Arc<dyn ResponseSource>,
    request: RevealRequest,
    events: mpsc::UnboundedSender<RevealEvent>,
) -> RevealHandle {
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let target = request.target;
    let task = tokio::spawn(run_reveal(source, request, events, cancel_rx));
    RevealHandle {
        target,
        cancel_tx: Some(cancel_tx),
        task,
    }
}

async fn run_reveal(
    source: Arc<dyn ResponseSource>,
    request: RevealRequest,
    events: mpsc::UnboundedSender<RevealEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let target = request.target;
    let emit = |payload| events.send(RevealEvent::new(target, payload)).is_ok();

    if !request.submit_delay.is_zero() {
        tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(reveal = ?target, "reveal cancelled before submission");
                return;
            }
            _ = tokio::time::sleep(request.submit_delay) => {}
        }
    }

    let body = tokio::select! {
        _ = &mut cancel_rx => {
            tracing::debug!(reveal = ?target, "reveal cancelled while awaiting source");
            return;
        }
        body = source.respond(&request.prompt) => body,
    };
    let mut tokens = match body {
        Ok(body) => token_stream(body),
        Err(error) => {
            tracing::warn!(reveal = ?target, source_id = source.id(), %error, "response source failed");
            emit(RevealPayload::Error(error.to_string()));
            return;
        }
    };

    if cancel_requested(&mut cancel_rx) || !emit(RevealPayload::Opened) {
        return;
    }

    let mut content = String::new();
    let mut published = 0_usize;
    loop {
        let next = tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(reveal = ?target, published, "reveal cancelled");
                return;
            }
            next = tokens.next() => next,
        };
        let token = match next {
            Some(Ok(token)) => token,
            Some(Err(error)) => {
                tracing::warn!(reveal = ?target, published, %error, "reply stream failed");
                emit(RevealPayload::Error(error.to_string()));
                return;
            }
            None => break,
        };

        if cancel_requested(&mut cancel_rx) {
            return;
        }
        push_token(&mut content, &token);
        published += 1;
        if !emit(RevealPayload::Content(content.clone())) {
            return;
        }

        let pause = request.pacing.next_interval();
        tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(reveal = ?target, published, "reveal cancelled");
                return;
            }
            _ = tokio::time::sleep(pause) => {}
        }
    }

    if cancel_requested(&mut cancel_rx) {
        return;
    }
    tracing::debug!(reveal = ?target, published, "reveal finished");
    emit(RevealPayload::Done(content));
}

/// A dropped sender counts as cancellation.
fn cancel_requested(cancel_rx: &mut oneshot::Receiver<()>) -> bool {
    !matches!(
        cancel_rx.try_recv(),
        Err(oneshot::error::TryRecvError::Empty)
    )
}

/// Flattens a reply into whitespace-free tokens.
///
/// Streamed fragments are split on whitespace independently, so sources
/// should not break words across fragments.
fn token_stream(body: ResponseBody) -> BoxStream<'static, SourceResult<String>> {
    match body {
        ResponseBody::Text(text) => stream::iter(tokenize(&text).into_iter().map(Ok)).boxed(),
        ResponseBody::Tokens(fragments) => fragments
            .flat_map(|fragment| {
                let tokens: Vec<SourceResult<String>> = match fragment {
                    Ok(fragment) => tokenize(&fragment).into_iter().map(Ok).collect(),
                    Err(error) => vec![Err(error)],
                };
                stream::iter(tokens)
            })
            .boxed(),
    }
}
