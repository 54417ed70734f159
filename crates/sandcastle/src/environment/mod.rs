//! Environment records, persistence and the service that drives them.

mod models;
mod registry;
mod service;

pub use models::{
    ActionType, Environment, EnvironmentLog, EnvironmentSession, EnvironmentStatus,
    EnvironmentType, LOG_OUTPUT_LIMIT, LogStatus, NewEnvironment, NewEnvironmentLog,
    format_db_timestamp, parse_db_timestamp,
};
pub use registry::{EnvironmentRegistry, SqliteEnvironmentRegistry};
pub use service::{CommandOutcome, EnvironmentDetails, EnvironmentService, EnvironmentServiceConfig};
