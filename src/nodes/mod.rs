pub mod common;
pub mod flow;
pub mod service;

pub use common::{EndExecutor, StartExecutor};
pub use flow::{ConditionExecutor, ForEachExecutor, ForkExecutor};
pub use service::{AiChatExecutor, DataProcessExecutor, JavaScriptExecutor, PluginExecutor, WikiExecutor};
