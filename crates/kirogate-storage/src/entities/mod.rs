pub mod api_keys;
pub mod groups;
pub mod request_logs;
pub mod settings;
pub mod tokens;

pub use api_keys::Entity as ApiKeys;
pub use groups::Entity as Groups;
pub use request_logs::Entity as RequestLogs;
pub use settings::Entity as SettingsRows;
pub use tokens::Entity as Tokens;
