pub mod config;
pub mod error;
pub mod filters;
pub mod types;

pub use config::{
    AutoAddConfig, CheckpointConfig, DashboardConfig, GatewayConfig, GovernorConfig, RunConfig,
    SessionConfig,
};
pub use error::{Result, RollcallError};
pub use filters::{FilterConfig, MemberFilter};
pub use types::*;
