use std::sync::Arc;

use std::sync::atomic::{AtomicUsize, Ordering};

use zkledger_ledger::{
    BroadcastPublisher, CryptoError, ErrorKind, KeyPair, Ledger, LedgerConfig, LedgerError, LedgerParams,
    MemoryVault, NoopPublisher, Note, NoteEvent, NoteEventKind, ProverError, ProverRegistry,
    ProvingBackend, Vault,
};
use zkledger_merkle::{HashKind, HashStrategy};
use zkledger_store::RecordStore;

/// Deterministic stand-in for a real proving system.
struct HashBackend;

impl HashBackend {
    fn tag(parts: &[&[u8]]) -> Vec<u8> {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(part);
        }
        hasher.finalize().as_bytes().to_vec()
    }
}

impl ProvingBackend for HashBackend {
    fn compile(&self, identifier: &str) -> Result<Vec<u8>, ProverError> {
        if identifier.is_empty() {
            return Err(ProverError::new("compile", "empty identifier"));
        }
        Ok(format!("circuit:{identifier}").into_bytes())
    }

    fn setup(&self, artifact: &[u8], srs: Option<&[u8]>) -> Result<KeyPair, ProverError> {
        let key = Self::tag(&[artifact, srs.unwrap_or_default()]);
        Ok(KeyPair {
            proving_key: key.clone(),
            verifying_key: key,
        })
    }

    fn prove(
        &self,
        _artifact: &[u8],
        proving_key: &[u8],
        witness: &[u8],
        _srs: Option<&[u8]>,
    ) -> Result<Vec<u8>, ProverError> {
        Ok(Self::tag(&[proving_key, witness]))
    }

    fn verify(
        &self,
        proof: &[u8],
        verifying_key: &[u8],
        witness: &[u8],
        _srs: Option<&[u8]>,
    ) -> Result<(), ProverError> {
        if Self::tag(&[verifying_key, witness]) != proof {
            return Err(ProverError::new("verify", "proof does not match witness"));
        }
        Ok(())
    }
}

/// Vault that counts key generations and can refuse them.
#[derive(Default)]
struct TrackingVault {
    inner: MemoryVault,
    generated: AtomicUsize,
    refuse_keys: bool,
}

impl Vault for TrackingVault {
    fn encrypt(&self, key_ref: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.inner.encrypt(key_ref, plaintext)
    }

    fn decrypt(&self, key_ref: &str, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.inner.decrypt(key_ref, ciphertext)
    }

    fn generate_key(&self, key_ref: &str) -> Result<(), CryptoError> {
        if self.refuse_keys {
            return Err(CryptoError::Unavailable);
        }
        self.generated.fetch_add(1, Ordering::SeqCst);
        self.inner.generate_key(key_ref)
    }

    fn remove_key(&self, key_ref: &str) -> Result<bool, CryptoError> {
        self.inner.remove_key(key_ref)
    }
}

fn registry_with(store: &RecordStore, vault: Arc<TrackingVault>) -> ProverRegistry {
    ProverRegistry::new(
        store.clone(),
        Arc::new(HashBackend),
        vault,
        Arc::new(NoopPublisher),
        LedgerConfig::default(),
    )
}

fn params(prover_id: &str) -> LedgerParams {
    LedgerParams {
        prover_id: prover_id.to_string(),
        key_ref: prover_id.to_string(),
        subject_prefix: "zkledger".to_string(),
        hasher: HashKind::Sha256,
        sparse_depth: 256,
    }
}

fn vault_with_key(key_ref: &str) -> Arc<MemoryVault> {
    let vault = MemoryVault::new();
    vault.set_key(key_ref, &[3u8; 32]).unwrap();
    Arc::new(vault)
}

fn open(store: &RecordStore, vault: &Arc<MemoryVault>) -> Ledger {
    Ledger::open(store.clone(), params("p"), vault.clone(), Arc::new(NoopPublisher)).unwrap()
}

fn note(tag: &str) -> Note {
    Note::new(format!("proof-{tag}").into_bytes(), format!("witness-{tag}").into_bytes())
}

#[test]
fn each_record_spends_its_predecessor() {
    let ledger = open(&RecordStore::in_memory(), &vault_with_key("p"));

    let first = ledger.record_proof(&note("a")).unwrap();
    let second = ledger.record_proof(&note("b")).unwrap();
    let third = ledger.record_proof(&note("c")).unwrap();

    assert!(first.nullified.is_none());
    assert_eq!(second.nullified.as_ref().map(|n| n.index), Some(0));
    assert_eq!(third.nullified.as_ref().map(|n| n.index), Some(1));
    assert_eq!(ledger.note_height().unwrap(), 3);
    assert_eq!(ledger.nullifier_height().unwrap(), 2);
    assert_eq!(ledger.note_root().unwrap(), third.note_root);
    assert!(ledger.is_spent(0).unwrap());
    assert!(ledger.is_spent(1).unwrap());
    assert!(!ledger.is_spent(2).unwrap());
}

#[test]
fn nullifying_a_spent_note_is_a_double_spend() {
    let ledger = open(&RecordStore::in_memory(), &vault_with_key("p"));
    ledger.record_proof(&note("a")).unwrap();
    ledger.record_proof(&note("b")).unwrap();
    let root = ledger.nullifier_root().unwrap();

    let err = ledger.nullify_note(0).unwrap_err();
    assert!(matches!(err, LedgerError::DoubleSpend { index: 0, .. }));
    assert_eq!(err.kind(), ErrorKind::Domain);
    assert_eq!(ledger.nullifier_root().unwrap(), root);

    // The newest note is left for the next record to spend.
    let err = ledger.nullify_note(1).unwrap_err();
    assert!(matches!(err, LedgerError::TipNote { index: 1 }));
    assert_eq!(err.kind(), ErrorKind::Structural);
    assert!(!ledger.is_spent(1).unwrap());

    let third = ledger.record_proof(&note("c")).unwrap();
    assert_eq!(third.nullified.map(|n| n.index), Some(1));
}

#[test]
fn double_spend_aborts_before_append() {
    let ledger = open(&RecordStore::in_memory(), &vault_with_key("p"));
    // Identical notes share a plaintext and therefore a nullifier key.
    ledger.record_proof(&note("same")).unwrap();
    ledger.record_proof(&note("same")).unwrap();
    let height = ledger.note_height().unwrap();
    let root = ledger.note_root().unwrap();

    let err = ledger.record_proof(&note("next")).unwrap_err();
    assert!(matches!(err, LedgerError::DoubleSpend { index: 1, .. }));
    assert_eq!(ledger.note_height().unwrap(), height);
    assert_eq!(ledger.note_root().unwrap(), root);
}

#[test]
fn nullifier_proofs_cover_spent_and_unspent_notes() {
    let ledger = open(&RecordStore::in_memory(), &vault_with_key("p"));
    ledger.record_proof(&note("a")).unwrap();
    ledger.record_proof(&note("b")).unwrap();
    let root = ledger.nullifier_root().unwrap();

    let (spent_plaintext, spent_key) = ledger.note_value_at(0).unwrap();
    let proof = ledger.nullifier_proof(&spent_key).unwrap();
    assert!(ledger
        .verify_nullifier_proof(&proof, &root, &spent_key, Some(&spent_plaintext))
        .unwrap());

    let (_, unspent_key) = ledger.note_value_at(1).unwrap();
    let proof = ledger.nullifier_proof(&unspent_key).unwrap();
    assert!(ledger
        .verify_nullifier_proof(&proof, &root, &unspent_key, None)
        .unwrap());
}

#[test]
fn note_proofs_validate_against_root() {
    let ledger = open(&RecordStore::in_memory(), &vault_with_key("p"));
    for tag in ["a", "b", "c", "d", "e"] {
        ledger.record_proof(&note(tag)).unwrap();
    }
    let root = ledger.note_root().unwrap();
    for index in 0..5 {
        let ciphertext = ledger.note_ciphertext_at(index).unwrap();
        let proof = ledger.note_proof(index).unwrap();
        assert!(proof.verify(&HashKind::Sha256, &ciphertext, &root));
        assert!(ledger.validate_note(&ciphertext, index, &proof.siblings).unwrap());
    }
    let err = ledger.note_proof(5).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Structural);
}

#[test]
fn ledger_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zkledger.db");
    let vault = vault_with_key("p");

    let (note_root, nullifier_root) = {
        let ledger = open(&RecordStore::persistent(&path).unwrap(), &vault);
        for tag in ["a", "b", "c"] {
            ledger.record_proof(&note(tag)).unwrap();
        }
        (ledger.note_root().unwrap(), ledger.nullifier_root().unwrap())
    };

    let ledger = open(&RecordStore::persistent(&path).unwrap(), &vault);
    assert_eq!(ledger.note_root().unwrap(), note_root);
    assert_eq!(ledger.nullifier_root().unwrap(), nullifier_root);
    assert_eq!(ledger.note_at(2).unwrap(), note("c"));
    assert!(ledger.is_spent(1).unwrap());

    let receipt = ledger.record_proof(&note("d")).unwrap();
    assert_eq!(receipt.index, 3);
    assert_eq!(receipt.nullified.map(|n| n.index), Some(2));
    ledger.verify().unwrap();
}

#[tokio::test]
async fn events_are_published_per_transition() {
    let publisher = BroadcastPublisher::new(16);
    let mut rx = publisher.subscribe();
    let ledger = Ledger::open(
        RecordStore::in_memory(),
        params("p"),
        vault_with_key("p"),
        Arc::new(publisher),
    )
    .unwrap();

    ledger.record_proof(&note("a")).unwrap();
    ledger.record_proof(&note("b")).unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        let message = rx.recv().await.unwrap();
        let event: NoteEvent = serde_json::from_slice(&message.payload).unwrap();
        seen.push((message.subject, event.kind, event.index));
    }
    assert_eq!(
        seen,
        vec![
            ("zkledger.p.note.deposited".to_string(), NoteEventKind::Deposited, 0),
            ("zkledger.p.note.deposited".to_string(), NoteEventKind::Deposited, 1),
            ("zkledger.p.note.nullified".to_string(), NoteEventKind::Nullified, 0),
        ]
    );
}

#[test]
fn publish_failures_do_not_fail_the_transition() {
    // No subscriber: every publish errors and is only logged.
    let ledger = Ledger::open(
        RecordStore::in_memory(),
        params("p"),
        vault_with_key("p"),
        Arc::new(BroadcastPublisher::new(4)),
    )
    .unwrap();
    ledger.record_proof(&note("a")).unwrap();
    ledger.record_proof(&note("b")).unwrap();
    assert_eq!(ledger.nullifier_height().unwrap(), 1);
}

#[test]
fn registry_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry.db");
    let vault = Arc::new(MemoryVault::new());
    let config = LedgerConfig {
        sparse_depth: 64,
        ..LedgerConfig::default()
    };

    let (id, proof) = {
        let registry = ProverRegistry::new(
            RecordStore::persistent(&path).unwrap(),
            Arc::new(HashBackend),
            vault.clone(),
            Arc::new(NoopPublisher),
            config.clone(),
        );
        let id = registry.register("balance-check", Some(b"srs".to_vec())).unwrap();
        let (proof, receipt) = registry.generate_proof(&id, b"witness-1".to_vec()).unwrap();
        assert_eq!(receipt.index, 0);
        registry.verify(&id, &proof, b"witness-1").unwrap();
        assert!(registry.verify(&id, &proof, b"other").is_err());
        registry.generate_proof(&id, b"witness-2".to_vec()).unwrap();
        (id, proof)
    };

    let store = RecordStore::persistent(&path).unwrap();
    let registry = ProverRegistry::load(
        store.clone(),
        Arc::new(HashBackend),
        vault.clone(),
        Arc::new(NoopPublisher),
        config,
    )
    .unwrap();
    assert_eq!(registry.ids().unwrap(), vec![id]);
    let record = registry.record(&id).unwrap();
    assert_eq!(record.identifier, "balance-check");
    assert_eq!(record.srs.as_deref(), Some(&b"srs"[..]));

    let ledger = registry.ledger(&id).unwrap();
    assert_eq!(ledger.note_height().unwrap(), 2);
    assert_eq!(ledger.note_at(0).unwrap().proof, proof);
    assert_eq!(
        ledger.params().hasher.digest(&ledger.note_value_at(0).unwrap().0),
        ledger.note_value_at(0).unwrap().1
    );

    registry.destroy(&id).unwrap();
    assert!(matches!(
        registry.ledger(&id),
        Err(LedgerError::UnknownProver(_))
    ));
    assert!(store.scan_prefix(b"").unwrap().is_empty());
    assert!(!vault.has_key(&record.key_ref));
}

#[test]
fn unknown_prover_and_failed_compile() {
    let registry = ProverRegistry::new(
        RecordStore::in_memory(),
        Arc::new(HashBackend),
        Arc::new(MemoryVault::new()),
        Arc::new(NoopPublisher),
        LedgerConfig::default(),
    );
    let err = registry.register("", None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Collaborator);
    let missing = uuid::Uuid::nil();
    assert!(matches!(
        registry.generate_proof(&missing, vec![]),
        Err(LedgerError::UnknownProver(_))
    ));
}

#[test]
fn vault_key_rotation_breaks_decryption() {
    let vault = vault_with_key("p");
    let ledger = open(&RecordStore::in_memory(), &vault);
    ledger.record_proof(&note("a")).unwrap();
    vault.generate_key("p").unwrap();

    let err = ledger.record_proof(&note("b")).unwrap_err();
    assert!(matches!(err, LedgerError::Crypto(_)));
    assert_eq!(ledger.note_height().unwrap(), 1);
}

#[test]
fn register_on_read_only_store_creates_no_vault_key() {
    let store = RecordStore::in_memory();
    let vault = Arc::new(TrackingVault::default());
    let registry = registry_with(&store, vault.clone());
    store.set_read_only(true);

    let err = registry.register("balance-check", None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Persistence);
    assert!(registry.ids().unwrap().is_empty());
    assert_eq!(vault.generated.load(Ordering::SeqCst), 0);

    store.set_read_only(false);
    registry.register("balance-check", None).unwrap();
    assert_eq!(vault.generated.load(Ordering::SeqCst), 1);
}

#[test]
fn failed_key_generation_removes_prover_record() {
    let store = RecordStore::in_memory();
    let vault = Arc::new(TrackingVault {
        refuse_keys: true,
        ..TrackingVault::default()
    });
    let registry = registry_with(&store, vault);

    let err = registry.register("balance-check", None).unwrap_err();
    assert!(matches!(err, LedgerError::Crypto(CryptoError::Unavailable)));
    assert!(registry.ids().unwrap().is_empty());
    assert!(store.scan_prefix(b"").unwrap().is_empty());
}

#[test]
fn failed_destroy_keeps_prover_registered() {
    let store = RecordStore::in_memory();
    let vault = Arc::new(TrackingVault::default());
    let registry = registry_with(&store, vault.clone());
    let id = registry.register("balance-check", None).unwrap();
    registry.generate_proof(&id, b"witness-1".to_vec()).unwrap();
    let key_ref = registry.record(&id).unwrap().key_ref;
    let rows = store.scan_prefix(b"").unwrap().len();

    store.set_read_only(true);
    assert!(registry.destroy(&id).is_err());
    assert_eq!(registry.ids().unwrap(), vec![id]);
    assert_eq!(registry.ledger(&id).unwrap().note_height().unwrap(), 1);
    assert!(vault.inner.has_key(&key_ref));
    assert_eq!(store.scan_prefix(b"").unwrap().len(), rows);

    store.set_read_only(false);
    registry.destroy(&id).unwrap();
    assert!(registry.ids().unwrap().is_empty());
    assert!(!vault.inner.has_key(&key_ref));
    assert!(store.scan_prefix(b"").unwrap().is_empty());
}
