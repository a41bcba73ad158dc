pub mod config;
pub mod control_channel;
pub mod error;
pub mod error_payload;
pub mod http_api;
pub mod hub;
pub mod instance_config;
pub mod log_buffer;
pub mod monitor;
pub mod process_manager;
pub mod pty;
pub mod recovery;
pub mod state;
pub mod status_query;
