pub mod config;
pub mod dsl;
pub mod compiler;
pub mod runtime;
pub mod nodes;
pub mod services;
