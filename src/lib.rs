pub mod api;
pub mod bridge;
pub mod cleanup;
pub mod config;
pub mod creds;
pub mod id;
pub mod notify;
pub mod orchestrator;
pub mod protocol;
pub mod publish;
pub mod qr;
pub mod reaper;
pub mod session;
pub mod shutdown;
