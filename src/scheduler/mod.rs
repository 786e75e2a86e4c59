//! Mutator threads and their coordination: suspension, checkpoints,
//! parallel marking workers and the finalizer daemon.

pub(crate) mod checkpoint;
pub(crate) mod finalizer_daemon;
pub mod thread;
pub(crate) mod thread_list;
pub(crate) mod worker;

pub use self::checkpoint::CheckpointFn;
pub use self::finalizer_daemon::FinalizerDaemon;
pub use self::thread::{ThreadHandle, ThreadRecord, ThreadState};
