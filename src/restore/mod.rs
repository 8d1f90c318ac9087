pub(crate) mod db_restore;

pub use db_restore::{PgRestoreExecutor, RestoreExecutor};
