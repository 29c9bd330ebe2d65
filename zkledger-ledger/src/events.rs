//! Best-effort note notifications.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use zkledger_merkle::Digest;
use zkledger_store::record::hex_digest;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteEventKind {
    Deposited,
    Nullified,
}

impl NoteEventKind {
    fn event_name(self) -> &'static str {
        match self {
            NoteEventKind::Deposited => "note.deposited",
            NoteEventKind::Nullified => "note.nullified",
        }
    }
}

/// Payload published after a note is appended or nullified.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoteEvent {
    pub prover_id: String,
    pub kind: NoteEventKind,
    /// Dense index of the note the event is about.
    pub index: usize,
    /// Root of the tree that changed.
    #[serde(with = "hex_digest")]
    pub root: Digest,
    /// Hex nullifier key, set for `Nullified` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nullifier: Option<String>,
}

impl NoteEvent {
    /// `<prefix>.<prover_id>.note.deposited` or `.note.nullified`.
    pub fn subject(&self, prefix: &str) -> String {
        format!("{prefix}.{}.{}", self.prover_id, self.kind.event_name())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("no subscriber for subject '{0}'")]
    NoSubscriber(String),
}

/// Publish/subscribe collaborator.
pub trait Publisher: Send + Sync {
    fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), PublishError>;
}

/// A message delivered by [`BroadcastPublisher`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Published {
    pub subject: String,
    pub payload: Vec<u8>,
}

/// In-process publisher over a tokio broadcast channel.
#[derive(Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<Published>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.sender.subscribe()
    }
}

impl Publisher for BroadcastPublisher {
    fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), PublishError> {
        self.sender
            .send(Published {
                subject: subject.to_string(),
                payload: payload.to_vec(),
            })
            .map(|_| ())
            .map_err(|_| PublishError::NoSubscriber(subject.to_string()))
    }
}

/// Publisher that drops every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopPublisher;

impl Publisher for NoopPublisher {
    fn publish(&self, _subject: &str, _payload: &[u8]) -> Result<(), PublishError> {
        Ok(())
    }
}
