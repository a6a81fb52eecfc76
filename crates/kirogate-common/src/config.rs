use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum BootConfigError {
    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

/// Process configuration resolved once at startup, entirely from the
/// environment. Runtime-tunable knobs live in [`crate::Settings`] instead.
#[derive(Debug, Clone)]
pub struct BootConfig {
    pub port: u16,
    /// Credential database (tokens, groups, api keys, settings).
    pub db_path: PathBuf,
    /// Request-log database. Kept separate so log growth cannot block
    /// credential writes through VACUUM or checkpointing.
    pub log_db_path: PathBuf,
    /// Optional shared cache for cross-process in-flight visibility.
    pub redis_url: Option<String>,
    pub max_tool_description_len: usize,
    /// Mirrors GIN_MODE from the predecessor deployment scripts; anything
    /// other than "debug" runs with production log defaults.
    pub debug_mode: bool,
}

impl BootConfig {
    pub fn from_env() -> Result<Self, BootConfigError> {
        let port = match std::env::var("PORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .map_err(|_| BootConfigError::InvalidValue("PORT", raw))?,
            Err(_) => 8080,
        };

        let db_path = std::env::var("KIRO_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/kiro2api.db"));
        let log_db_path = std::env::var("KIRO_LOG_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| derive_log_db_path(&db_path));

        let max_tool_description_len = match std::env::var("MAX_TOOL_DESCRIPTION_LENGTH") {
            Ok(raw) => raw
                .parse::<usize>()
                .map_err(|_| BootConfigError::InvalidValue("MAX_TOOL_DESCRIPTION_LENGTH", raw))?,
            Err(_) => 10_000,
        };

        Ok(Self {
            port,
            db_path,
            log_db_path,
            redis_url: std::env::var("REDIS_URL").ok().filter(|v| !v.is_empty()),
            max_tool_description_len,
            debug_mode: std::env::var("KIRO_MODE").is_ok_and(|v| v == "debug"),
        })
    }

    /// Legacy JSON config candidate next to the database; migrated into the
    /// DB on first boot and never read again.
    pub fn legacy_config_path(&self) -> PathBuf {
        self.db_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("auth_config.json")
    }
}

fn derive_log_db_path(db_path: &Path) -> PathBuf {
    let stem = db_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "kiro2api".to_string());
    db_path.with_file_name(format!("{stem}_logs.db"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_db_path_derives_from_db_path() {
        let derived = derive_log_db_path(Path::new("/var/lib/kiro/kiro2api.db"));
        assert_eq!(derived, PathBuf::from("/var/lib/kiro/kiro2api_logs.db"));
    }
}
