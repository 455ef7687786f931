pub mod config;
pub mod constants;
pub mod coordinator;
pub mod errors;
pub mod job_encoding;
pub mod jsonrpc_event;
pub mod metrics;
pub mod pow;
pub mod share_window;
pub mod shares_manager;
pub mod stratum_context;
pub mod stratum_handler;
pub mod stratum_listener;
pub mod template_registry;
pub mod template_source;
pub mod vardiff;
pub mod worker_stats;

pub use config::*;
pub use coordinator::*;
pub use errors::*;
pub use job_encoding::*;
pub use jsonrpc_event::*;
pub use pow::*;
pub use share_window::*;
pub use shares_manager::*;
pub use stratum_context::*;
pub use stratum_handler::*;
pub use stratum_listener::*;
pub use template_registry::*;
pub use template_source::*;
pub use vardiff::*;
pub use worker_stats::*;
