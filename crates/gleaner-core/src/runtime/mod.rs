pub mod executor;
pub mod record;
pub mod storage;
pub mod supervisor;
pub mod types;
