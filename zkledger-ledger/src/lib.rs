//! Note/nullifier ledger for a zero-knowledge proof issuing service.
//!
//! Each registered prover owns a [`Ledger`]: an append-only dense tree of
//! encrypted notes and a sparse tree of nullifiers that marks notes as spent.
//! Recording a proof appends a note and spends the one before it, so any note
//! can be spent at most once.
//!
//! Collaborators are reached through narrow traits: [`Vault`] for note
//! encryption, [`Publisher`] for best-effort events and [`ProvingBackend`] for
//! compile/setup/prove/verify.

pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod note;
pub mod prover;
pub mod vault;

pub use config::LedgerConfig;
pub use error::{ErrorKind, LedgerError};
pub use events::{BroadcastPublisher, NoopPublisher, NoteEvent, NoteEventKind, Publisher};
pub use ledger::{Ledger, LedgerParams, LedgerStatus, NullifiedNote, RecordReceipt};
pub use note::{Note, NullifierKey};
pub use prover::{KeyPair, ProverError, ProverRecord, ProverRegistry, ProvingBackend};
pub use vault::{CryptoError, MemoryVault, Vault};
