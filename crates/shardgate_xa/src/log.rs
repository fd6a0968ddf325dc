//! Durable per-transaction, per-participant state.
//!
//! Every write goes to the [`LogStore`] first and only then updates the
//! in-memory view, so a failed write leaves the cached record untouched and
//! the caller sees the storage error before it can send any command.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

use shardgate_common::error::{ShardgateResult, StorageError, XaError};
use shardgate_common::types::{ParticipantId, Xid};

use crate::record::{LogKey, LogValue, ParticipantState, TransactionRecord};
use crate::state::{TxStage, XaSubState};
use crate::store::LogStore;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnLogStats {
    pub participant_writes: u64,
    pub stage_writes: u64,
    pub failed_writes: u64,
    pub purged: u64,
}

pub struct TransactionLog {
    store: Arc<dyn LogStore>,
    records: RwLock<HashMap<Xid, TransactionRecord>>,
    participant_writes: AtomicU64,
    stage_writes: AtomicU64,
    failed_writes: AtomicU64,
    purged: AtomicU64,
}

impl TransactionLog {
    /// Load every record the store holds, deleting orphan participant
    /// records left by an interrupted purge.
    pub fn open(store: Arc<dyn LogStore>) -> ShardgateResult<Self> {
        Self::load(store, true)
    }

    /// Load without writing to the store. Orphans are skipped and logged.
    pub fn open_read_only(store: Arc<dyn LogStore>) -> ShardgateResult<Self> {
        Self::load(store, false)
    }

    fn load(store: Arc<dyn LogStore>, repair: bool) -> ShardgateResult<Self> {
        let mut coordinators: HashMap<Xid, TransactionRecord> = HashMap::new();
        let mut branches: Vec<(Xid, ParticipantId, XaSubState, u64)> = Vec::new();

        for (key, value) in store.scan()? {
            let Some(log_key) = LogKey::decode(&key) else {
                tracing::warn!(key = %key, "skipping unrecognised transaction log key");
                continue;
            };
            let value: LogValue = bincode::deserialize(&value).map_err(|e| StorageError::Corrupted {
                offset: 0,
                reason: format!("{key}: {e}"),
            })?;
            match (log_key, value) {
                (
                    LogKey::Coordinator(xid),
                    LogValue::Coordinator {
                        stage,
                        explicit,
                        participants,
                        updated_at_ms,
                    },
                ) => {
                    let participants = participants
                        .into_iter()
                        .map(|participant| ParticipantState {
                            participant,
                            sub_state: XaSubState::Started,
                        })
                        .collect();
                    coordinators.insert(
                        xid.clone(),
                        TransactionRecord {
                            xid,
                            stage,
                            explicit,
                            participants,
                            updated_at_ms,
                        },
                    );
                }
                (LogKey::Participant(xid, p), LogValue::Participant { sub_state, updated_at_ms }) => {
                    branches.push((xid, p, sub_state, updated_at_ms));
                }
                _ => {
                    return Err(StorageError::Corrupted {
                        offset: 0,
                        reason: format!("{key}: value kind does not match key"),
                    }
                    .into());
                }
            }
        }

        for (xid, p, sub_state, updated_at_ms) in branches {
            let slot = coordinators.get_mut(&xid).and_then(|rec| {
                rec.updated_at_ms = rec.updated_at_ms.max(updated_at_ms);
                rec.participants.iter_mut().find(|s| s.participant == p)
            });
            match slot {
                Some(slot) => slot.sub_state = sub_state,
                // Left behind by a purge interrupted between its deletes.
                None if repair => {
                    tracing::warn!(xid = %xid, participant = %p, "dropping orphan participant record");
                    store.delete(&LogKey::Participant(xid, p).encode())?;
                }
                None => tracing::warn!(xid = %xid, participant = %p, "ignoring orphan participant record"),
            }
        }

        let unfinished = coordinators.values().filter(|r| !r.is_terminal()).count();
        tracing::info!(records = coordinators.len(), unfinished, "transaction log loaded");
        Ok(Self {
            store,
            records: RwLock::new(coordinators),
            participant_writes: AtomicU64::new(0),
            stage_writes: AtomicU64::new(0),
            failed_writes: AtomicU64::new(0),
            purged: AtomicU64::new(0),
        })
    }

    /// Create the coordinator record for a new transaction in `Initialize`.
    pub fn begin(&self, xid: &Xid, participants: &[ParticipantId], explicit: bool) -> ShardgateResult<()> {
        let updated_at_ms = now_ms();
        let value = LogValue::Coordinator {
            stage: TxStage::Initialize,
            explicit,
            participants: participants.to_vec(),
            updated_at_ms,
        };
        self.write(xid, "begin", &LogKey::Coordinator(xid.clone()), &value)?;
        self.stage_writes.fetch_add(1, Ordering::Relaxed);
        self.records.write().insert(
            xid.clone(),
            TransactionRecord {
                xid: xid.clone(),
                stage: TxStage::Initialize,
                explicit,
                participants: participants
                    .iter()
                    .map(|&participant| ParticipantState {
                        participant,
                        sub_state: XaSubState::Started,
                    })
                    .collect(),
                updated_at_ms,
            },
        );
        Ok(())
    }

    /// Durably record one participant's sub-state. Overwrites any earlier
    /// value for `(xid, participant)`.
    pub fn record(&self, xid: &Xid, participant: ParticipantId, sub_state: XaSubState) -> ShardgateResult<()> {
        {
            let records = self.records.read();
            let rec = records
                .get(xid)
                .ok_or_else(|| XaError::UnknownTransaction(xid.clone()))?;
            if rec.sub_state(participant).is_none() {
                return Err(XaError::Backend {
                    xid: xid.clone(),
                    participant,
                    message: "not a participant of this transaction".into(),
                }
                .into());
            }
        }
        let updated_at_ms = now_ms();
        let value = LogValue::Participant {
            sub_state,
            updated_at_ms,
        };
        self.write(xid, "participant", &LogKey::Participant(xid.clone(), participant), &value)?;
        self.participant_writes.fetch_add(1, Ordering::Relaxed);

        if let Some(rec) = self.records.write().get_mut(xid) {
            if let Some(slot) = rec.participants.iter_mut().find(|s| s.participant == participant) {
                slot.sub_state = sub_state;
            }
            rec.updated_at_ms = updated_at_ms;
        }
        Ok(())
    }

    /// Durably record the transaction-level stage.
    pub fn record_stage(&self, xid: &Xid, stage: TxStage) -> ShardgateResult<()> {
        let (explicit, participants) = {
            let records = self.records.read();
            let rec = records
                .get(xid)
                .ok_or_else(|| XaError::UnknownTransaction(xid.clone()))?;
            (rec.explicit, rec.participants.iter().map(|s| s.participant).collect::<Vec<_>>())
        };
        let updated_at_ms = now_ms();
        let value = LogValue::Coordinator {
            stage,
            explicit,
            participants,
            updated_at_ms,
        };
        self.write(xid, "stage", &LogKey::Coordinator(xid.clone()), &value)?;
        self.stage_writes.fetch_add(1, Ordering::Relaxed);

        if let Some(rec) = self.records.write().get_mut(xid) {
            rec.stage = stage;
            rec.updated_at_ms = updated_at_ms;
        }
        Ok(())
    }

    fn write(&self, xid: &Xid, kind: &str, key: &LogKey, value: &LogValue) -> ShardgateResult<()> {
        let bytes = bincode::serialize(value).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let started = Instant::now();
        let result = self.store.put(&key.encode(), &bytes);
        let elapsed = started.elapsed().as_micros() as u64;
        shardgate_observability::record_txn_log_write(kind, result.is_ok(), elapsed);
        result.map_err(|e| {
            self.failed_writes.fetch_add(1, Ordering::Relaxed);
            tracing::error!(xid = %xid, kind, error = %e, "transaction log write failed");
            XaError::LogFailure {
                xid: xid.clone(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    pub fn get(&self, xid: &Xid) -> Option<TransactionRecord> {
        self.records.read().get(xid).cloned()
    }

    /// Non-terminal records, oldest first.
    pub fn unfinished(&self) -> Vec<TransactionRecord> {
        let mut out: Vec<_> = self
            .records
            .read()
            .values()
            .filter(|r| !r.is_terminal())
            .cloned()
            .collect();
        out.sort_by(|a, b| a.updated_at_ms.cmp(&b.updated_at_ms).then_with(|| a.xid.cmp(&b.xid)));
        out
    }

    pub fn all(&self) -> Vec<TransactionRecord> {
        let mut out: Vec<_> = self.records.read().values().cloned().collect();
        out.sort_by(|a, b| a.xid.cmp(&b.xid));
        out
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Remove a terminal transaction from the log. Returns false when the
    /// xid is unknown.
    pub fn purge(&self, xid: &Xid) -> ShardgateResult<bool> {
        let participants = {
            let records = self.records.read();
            let Some(rec) = records.get(xid) else {
                return Ok(false);
            };
            if !rec.is_terminal() {
                return Err(XaError::InvalidState {
                    xid: xid.clone(),
                    stage: rec.stage.to_string(),
                    op: "purge",
                }
                .into());
            }
            rec.participants.iter().map(|s| s.participant).collect::<Vec<_>>()
        };
        // Coordinator key first: a crash part-way leaves orphan participant
        // keys, which `open` cleans up.
        self.store.delete(&LogKey::Coordinator(xid.clone()).encode())?;
        for p in participants {
            self.store.delete(&LogKey::Participant(xid.clone(), p).encode())?;
        }
        self.records.write().remove(xid);
        self.purged.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(xid = %xid, "transaction purged from log");
        Ok(true)
    }

    pub fn stats(&self) -> TxnLogStats {
        TxnLogStats {
            participant_writes: self.participant_writes.load(Ordering::Relaxed),
            stage_writes: self.stage_writes.load(Ordering::Relaxed),
            failed_writes: self.failed_writes.load(Ordering::Relaxed),
            purged: self.purged.load(Ordering::Relaxed),
        }
    }
}
