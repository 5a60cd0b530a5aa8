pub mod credentials;
pub mod credits;
pub mod inference;
pub mod kv;
pub mod queue;
pub mod reconcile;
pub mod retry;
pub mod storage;
