mod config;
mod error;
mod settings;

pub use config::{BootConfig, BootConfigError};
pub use error::{error_code_from_status, error_type_from_status, ApiError, ErrorResponse};
pub use settings::Settings;
