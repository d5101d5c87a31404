pub mod config;
pub mod error;
pub mod fs;
pub mod state;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, SmartGraphError};
pub use state::{Reducer, StateManager};
pub use types::*;
