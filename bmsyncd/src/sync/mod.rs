pub mod backoff;
mod conflict;
pub mod local_state;
pub mod local_watcher;
pub mod paths;
pub mod scheduler;
pub mod storage;
pub mod syncer;
