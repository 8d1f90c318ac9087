pub(crate) mod db_dump;
pub(crate) mod drive_upload;
pub(crate) mod naming;
pub(crate) mod orchestrator;
pub(crate) mod remote;
pub(crate) mod retry;
pub(crate) mod s3_upload;

pub use db_dump::{PgDumpProducer, SnapshotProducer};
pub use orchestrator::{BackupOrchestrator, BackupOutcome, FailureKind, Initiator, OrchestratorDeps, RunResult};
pub use remote::{RemoteStore, build_remote_store};
