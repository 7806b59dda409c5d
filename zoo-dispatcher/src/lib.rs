pub mod broker;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod download;
pub mod enrich;
pub mod error;
pub mod publish;
