pub mod config;
pub mod db;
pub mod llm;
pub mod models;
pub mod server;
pub mod service;
pub mod settings;
pub mod telemetry;
pub mod vault;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::config::AppConfig;
    pub use crate::llm::factory::ClientFactory;
    pub use crate::models::{ProviderKind, ProviderRef};
    pub use crate::service::{AiProviderService, ServiceError};
    pub use crate::settings::SettingsStore;
    pub use crate::vault::CredentialVault;
    pub use crate::{config, db, llm, models, server, service, settings, telemetry, vault};
}
