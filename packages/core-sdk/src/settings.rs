use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use rusqlite::Connection;
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db;
use crate::models::{
    DecryptedProvider, NewProvider, ProviderConfig, ProviderKind, ProviderRef, ProviderUpdate,
    UserAiSettings,
};
use crate::vault::{CredentialVault, VaultError};

/** \brief 版本冲突时重新读取并重放变更的次数上限。 */
const MAX_CONFLICT_RETRIES: usize = 5;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("provider {0} not found")]
    NotFound(ProviderRef),
    #[error("provider {0} is not configured")]
    NotConfigured(ProviderKind),
    #[error("settings were modified concurrently, please retry")]
    Conflict,
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
    #[error("settings document is malformed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/**
 * \brief 在用户设置中定位 Provider，下标与 ID 两种方式。
 */
pub fn locate(settings: &UserAiSettings, reference: ProviderRef) -> Result<usize, SettingsError> {
    match reference {
        ProviderRef::Index(i) if i < settings.providers.len() => Ok(i),
        ProviderRef::Index(_) => Err(SettingsError::NotFound(reference)),
        ProviderRef::Id(id) => settings
            .position_of(id)
            .ok_or(SettingsError::NotFound(reference)),
    }
}

/**
 * \brief 用户 AI 设置的唯一写入者。
 * \details 每个用户一份 JSON 文档整体替换；替换以版本号做比较并交换，冲突时重读重放。
 */
pub struct SettingsStore {
    conn: Mutex<Connection>,
    vault: Arc<CredentialVault>,
}

impl std::fmt::Debug for SettingsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsStore").finish_non_exhaustive()
    }
}

impl SettingsStore {
    /**
     * \brief 包装一个已完成迁移的连接。
     */
    pub fn new(conn: Connection, vault: Arc<CredentialVault>) -> Self {
        Self {
            conn: Mutex::new(conn),
            vault,
        }
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.vault
    }

    pub fn get(&self, user_id: &str) -> Result<Option<UserAiSettings>, SettingsError> {
        let conn = self.lock()?;
        Ok(read(&conn, user_id)?.map(|(settings, _)| settings))
    }

    /**
     * \brief 幂等：首次访问时创建空设置。
     */
    pub fn get_or_create(&self, user_id: &str) -> Result<UserAiSettings, SettingsError> {
        let conn = self.lock()?;
        match read(&conn, user_id)? {
            Some((settings, _)) => Ok(settings),
            None => Ok(create(&conn, user_id)?.0),
        }
    }

    /**
     * \brief 新增 Provider：Key 先经 Vault 加密；首个或显式标记默认的条目成为唯一默认项。
     */
    pub fn add_provider(
        &self,
        user_id: &str,
        new: &NewProvider,
    ) -> Result<UserAiSettings, SettingsError> {
        let encrypted = self.vault.encrypt(new.api_key.trim())?;
        let settings = self.mutate(user_id, None, |settings| {
            let now = OffsetDateTime::now_utc();
            settings.providers.push(ProviderConfig {
                id: Uuid::new_v4(),
                provider: new.provider,
                encrypted_api_key: encrypted.clone(),
                model: new.model.trim().to_string(),
                is_active: true,
                is_default: false,
                parameters: new.parameters.clone(),
                display_name: normalize_display_name(new.display_name.as_deref()),
                created_at: now,
                updated_at: now,
            });
            let last = settings.providers.len() - 1;
            if last == 0 || new.is_default || settings.default_entry().is_none() {
                settings.make_default(last);
            }
            Ok(())
        })?;
        info!(user_id, provider = %new.provider, "provider added");
        Ok(settings)
    }

    /** \brief 下标寻址的兼容入口。 */
    pub fn update_provider(
        &self,
        user_id: &str,
        index: usize,
        update: &ProviderUpdate,
    ) -> Result<UserAiSettings, SettingsError> {
        self.apply_update(user_id, ProviderRef::Index(index), update)
    }

    pub fn update_provider_by_id(
        &self,
        user_id: &str,
        id: Uuid,
        update: &ProviderUpdate,
    ) -> Result<UserAiSettings, SettingsError> {
        self.apply_update(user_id, ProviderRef::Id(id), update)
    }

    /** \brief 下标寻址的兼容入口。 */
    pub fn remove_provider(
        &self,
        user_id: &str,
        index: usize,
    ) -> Result<UserAiSettings, SettingsError> {
        self.apply_remove(user_id, ProviderRef::Index(index))
    }

    pub fn remove_provider_by_id(
        &self,
        user_id: &str,
        id: Uuid,
    ) -> Result<UserAiSettings, SettingsError> {
        self.apply_remove(user_id, ProviderRef::Id(id))
    }

    /**
     * \brief 将某一类型设为默认：已有同类型默认项时保持不变，否则优先选择首个启用的条目。
     */
    pub fn set_default(
        &self,
        user_id: &str,
        kind: ProviderKind,
    ) -> Result<UserAiSettings, SettingsError> {
        let missing = || SettingsError::NotConfigured(kind);
        self.mutate(user_id, Some(&missing), |settings| {
            if let Some(current) = settings
                .providers
                .iter()
                .position(|p| p.is_default && p.provider == kind)
            {
                settings.make_default(current);
                return Ok(());
            }
            let index = settings
                .providers
                .iter()
                .position(|p| p.provider == kind && p.is_active)
                .or_else(|| settings.providers.iter().position(|p| p.provider == kind))
                .ok_or(SettingsError::NotConfigured(kind))?;
            settings.make_default(index);
            Ok(())
        })
    }

    pub fn set_auto_generate(
        &self,
        user_id: &str,
        enabled: bool,
    ) -> Result<UserAiSettings, SettingsError> {
        self.mutate(user_id, None, |settings| {
            settings.auto_generate_on_save = enabled;
            Ok(())
        })
    }

    /**
     * \brief 解析可用的 Provider 并解密 Key。
     * \param kind 显式指定的类型，缺省时使用用户的默认类型
     * \details 同类型下优先默认项；无法解密的条目记录告警后跳过，视为未配置。
     */
    pub fn get_active_provider(
        &self,
        user_id: &str,
        kind: Option<ProviderKind>,
    ) -> Result<Option<DecryptedProvider>, SettingsError> {
        let Some(settings) = self.get(user_id)? else {
            return Ok(None);
        };
        let Some(target) = kind
            .or(settings.default_provider)
            .or_else(|| settings.default_entry().map(|p| p.provider))
        else {
            return Ok(None);
        };

        let mut candidates: Vec<&ProviderConfig> = settings
            .providers
            .iter()
            .filter(|p| p.provider == target && p.is_active)
            .collect();
        candidates.sort_by_key(|p| !p.is_default);

        for entry in candidates {
            match self.vault.decrypt(&entry.encrypted_api_key) {
                Ok(api_key) => return Ok(Some(DecryptedProvider::from_config(entry, api_key))),
                Err(e) => {
                    warn!(user_id, provider_id = %entry.id, error = %e, "stored api key cannot be decrypted, skipping");
                }
            }
        }
        Ok(None)
    }

    fn apply_update(
        &self,
        user_id: &str,
        reference: ProviderRef,
        update: &ProviderUpdate,
    ) -> Result<UserAiSettings, SettingsError> {
        let encrypted = match update.new_api_key() {
            Some(key) => Some(self.vault.encrypt(key.trim())?),
            None => None,
        };
        let missing = || SettingsError::NotFound(reference);
        let settings = self.mutate(user_id, Some(&missing), |settings| {
            let index = locate(settings, reference)?;
            let entry = &mut settings.providers[index];
            if let Some(ciphertext) = &encrypted {
                entry.encrypted_api_key = ciphertext.clone();
            }
            if let Some(model) = &update.model {
                entry.model = model.trim().to_string();
            }
            if let Some(name) = &update.display_name {
                entry.display_name = normalize_display_name(Some(name));
            }
            if let Some(parameters) = &update.parameters {
                entry.parameters = parameters.clone();
            }
            if let Some(active) = update.is_active {
                entry.is_active = active;
            }
            entry.updated_at = OffsetDateTime::now_utc();
            let was_default = entry.is_default;

            match update.is_default {
                Some(true) => settings.make_default(index),
                Some(false) if was_default && settings.providers.len() > 1 => {
                    let other = if index == 0 { 1 } else { 0 };
                    settings.make_default(other);
                }
                _ => {}
            }
            Ok(())
        })?;
        debug!(user_id, %reference, rekeyed = encrypted.is_some(), "provider updated");
        Ok(settings)
    }

    fn apply_remove(
        &self,
        user_id: &str,
        reference: ProviderRef,
    ) -> Result<UserAiSettings, SettingsError> {
        let missing = || SettingsError::NotFound(reference);
        let settings = self.mutate(user_id, Some(&missing), |settings| {
            let index = locate(settings, reference)?;
            let removed = settings.providers.remove(index);
            if settings.providers.is_empty() {
                settings.default_provider = None;
            } else if removed.is_default || settings.default_entry().is_none() {
                settings.make_default(0);
            }
            Ok(())
        })?;
        info!(user_id, %reference, "provider removed");
        Ok(settings)
    }

    /**
     * \brief 读取-变更-比较并交换写回。
     * \param on_missing 设置不存在时返回的错误；为 None 时先创建空设置
     */
    fn mutate<F>(
        &self,
        user_id: &str,
        on_missing: Option<&dyn Fn() -> SettingsError>,
        mut apply: F,
    ) -> Result<UserAiSettings, SettingsError>
    where
        F: FnMut(&mut UserAiSettings) -> Result<(), SettingsError>,
    {
        let conn = self.lock()?;
        for attempt in 0..=MAX_CONFLICT_RETRIES {
            let (mut settings, version) = match read(&conn, user_id)? {
                Some(found) => found,
                None => match on_missing {
                    Some(err) => return Err(err()),
                    None => create(&conn, user_id)?,
                },
            };
            apply(&mut settings)?;
            let now = OffsetDateTime::now_utc();
            settings.updated_at = now;
            let document = serde_json::to_string(&settings)?;
            if db::replace_settings_document(
                &conn,
                user_id,
                &document,
                version,
                now.unix_timestamp(),
            )? {
                return Ok(settings);
            }
            warn!(user_id, attempt, "settings version conflict, retrying");
        }
        Err(SettingsError::Conflict)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, SettingsError> {
        self.conn
            .lock()
            .map_err(|_| SettingsError::Storage(anyhow!("settings connection lock poisoned")))
    }

    #[cfg(test)]
    pub(crate) fn into_connection(self) -> Connection {
        self.conn.into_inner().expect("settings connection lock")
    }
}

fn normalize_display_name(name: Option<&str>) -> Option<String> {
    name.map(str::trim)
        .filter(|n| !n.is_empty())
        .map(|n| n.to_string())
}

/**
 * \brief 读取文档；旧文档中缺少 id 的条目在此补齐并写回。
 */
fn read(
    conn: &Connection,
    user_id: &str,
) -> Result<Option<(UserAiSettings, i64)>, SettingsError> {
    for _ in 0..=MAX_CONFLICT_RETRIES {
        let Some(doc) = db::load_settings_document(conn, user_id)? else {
            return Ok(None);
        };
        let raw: Value = serde_json::from_str(&doc.document)?;
        let needs_ids = missing_provider_ids(&raw);
        let settings: UserAiSettings = serde_json::from_value(raw)?;
        if !needs_ids {
            return Ok(Some((settings, doc.version)));
        }
        let document = serde_json::to_string(&settings)?;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        if db::replace_settings_document(conn, user_id, &document, doc.version, now)? {
            info!(user_id, "back-filled provider identifiers");
            return Ok(Some((settings, doc.version + 1)));
        }
    }
    Err(SettingsError::Conflict)
}

fn create(conn: &Connection, user_id: &str) -> Result<(UserAiSettings, i64), SettingsError> {
    let now = OffsetDateTime::now_utc();
    let settings = UserAiSettings::new(user_id, now);
    let document = serde_json::to_string(&settings)?;
    if db::insert_settings_document(conn, user_id, &document, now.unix_timestamp())? {
        debug!(user_id, "created empty ai settings");
    }
    read(conn, user_id)?.ok_or_else(|| {
        SettingsError::Storage(anyhow!("settings for {} missing right after insert", user_id))
    })
}

fn missing_provider_ids(raw: &Value) -> bool {
    raw.get("providers")
        .and_then(|p| p.as_array())
        .is_some_and(|list| list.iter().any(|p| p.get("id").is_none()))
}
