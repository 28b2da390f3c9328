pub mod decision;
pub mod engine;
pub mod integrity;
pub mod probe;
pub mod scanner;
pub mod scheduler;
pub mod transfer;
pub mod version;

#[cfg(test)]
pub(crate) mod testing;

pub use decision::{Decision, GateOutcome, SyncDecision};
pub use engine::{CycleOutcome, EngineConfig, ForceCheck, SyncEngine, UPDATE_MARKER};
pub use integrity::{IntegrityChecker, VerifiedFile, VerifyMode};
pub use probe::{ProcessProbe, SystemProcessProbe};
pub use scheduler::{CheckSchedule, CycleRunner, RetryPolicy, Scheduler};
pub use transfer::{Transfer, TransferOptions, TransferOutcome};
pub use version::{ResolvedVersion, VersionResolver, VersionTag};
