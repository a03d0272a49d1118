pub mod context;
pub mod blueprint;
pub mod engine;
pub mod error;
pub mod eval;
pub mod expression;
pub mod node;
pub mod record;
pub mod recorder;
pub mod scheduler;
pub mod syscall;
pub mod storage;
pub mod redis_storage;
pub mod value;
