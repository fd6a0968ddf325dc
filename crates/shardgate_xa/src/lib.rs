//! XA two-phase commit coordination across shard connections, backed by a
//! durable transaction log for crash recovery.

pub mod backend;
pub mod coordinator;
pub mod log;
pub mod record;
pub mod recovery;
pub mod stage;
pub mod state;
pub mod store;

pub use backend::XaBackend;
pub use coordinator::{TxnSnapshot, XaCoordinator, XaCoordinatorStats, XaTransaction};
pub use log::{TransactionLog, TxnLogStats};
pub use record::{ParticipantState, TransactionRecord};
pub use recovery::{RecoveryReport, RecoverySweeper, SweeperHandle, SweeperMetrics};
pub use stage::{NotaCheck, StageKind};
pub use state::{Intent, TxStage, XaOutcome, XaSubState};
pub use store::{FileLogStore, FileLogStoreStats, LogStore, MemLogStore};
