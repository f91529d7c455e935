//! 应用配置和持久化
//!
//! - [`HceConfig`]: 卡模拟端使用的 AID 和标识符，可以在运行时热替换
//! - [`ConfigStore`]: 持久化键值存储 (`aid` / `uuid` / `last_read`)
//! - [`AppSettings`]: 设备名称、广播参数等设置 (TOML)

use crate::ble::DEFAULT_SERVICE_UUID;
use crate::ble::adv::{AdvertiseMode, TxPowerLevel};
use crate::nfc::apdu::decode_hex;
use crate::{Error, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

pub const KEY_AID: &str = "aid";
pub const KEY_IDENTIFIER: &str = "uuid";
pub const KEY_LAST_READ: &str = "last_read";

/// 标识符字节长度 (32 个十六进制字符)
pub const IDENTIFIER_LEN: usize = 16;
/// ISO 7816-5 允许的最长 AID
pub const MAX_AID_LEN: usize = 16;

/// 卡模拟配置
///
/// 构造时校验：AID 为偶数长度十六进制，标识符去掉连字符后正好 16 字节。
/// 两个字段都以大写无连字符的形式保存。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawHceConfig", into = "RawHceConfig")]
pub struct HceConfig {
    aid: String,
    identifier: String,
}

#[derive(Serialize, Deserialize)]
struct RawHceConfig {
    aid: String,
    uuid: String,
}

impl TryFrom<RawHceConfig> for HceConfig {
    type Error = Error;

    fn try_from(raw: RawHceConfig) -> Result<Self> {
        HceConfig::new(&raw.aid, &raw.uuid)
    }
}

impl From<HceConfig> for RawHceConfig {
    fn from(config: HceConfig) -> Self {
        RawHceConfig {
            aid: config.aid,
            uuid: config.identifier,
        }
    }
}

impl Default for HceConfig {
    fn default() -> Self {
        Self {
            aid: Self::DEFAULT_AID.to_string(),
            identifier: "12345678123456781234567812345678".to_string(),
        }
    }
}

impl HceConfig {
    pub const DEFAULT_AID: &'static str = "F00000000A0101";

    pub fn new(aid: &str, identifier: &str) -> Result<Self> {
        let aid_bytes = decode_hex(aid)
            .map_err(|e| Error::InvalidConfig(format!("AID '{}' is not valid hex: {}", aid, e)))?;
        if aid_bytes.is_empty() || aid_bytes.len() > MAX_AID_LEN {
            return Err(Error::InvalidConfig(format!(
                "AID must be 1..={} bytes, got {}",
                MAX_AID_LEN,
                aid_bytes.len()
            )));
        }

        let id_bytes = decode_hex(identifier).map_err(|e| {
            Error::InvalidIdentifier(format!("'{}' is not valid hex: {}", identifier, e))
        })?;
        if id_bytes.len() != IDENTIFIER_LEN {
            return Err(Error::InvalidIdentifier(format!(
                "expected {} bytes, got {}",
                IDENTIFIER_LEN,
                id_bytes.len()
            )));
        }

        Ok(Self {
            aid: hex::encode_upper(aid_bytes),
            identifier: hex::encode_upper(id_bytes),
        })
    }

    pub fn aid(&self) -> &str {
        &self.aid
    }

    /// 32 个十六进制字符，无连字符
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn aid_bytes(&self) -> Vec<u8> {
        // 构造时已校验
        decode_hex(&self.aid).unwrap_or_default()
    }

    pub fn identifier_bytes(&self) -> Vec<u8> {
        decode_hex(&self.identifier).unwrap_or_default()
    }
}

/// 持久化键值存储
pub trait ConfigStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// 读取卡模拟配置，缺失的字段使用默认值
pub fn load_hce_config(store: &dyn ConfigStore) -> Result<HceConfig> {
    let defaults = HceConfig::default();
    let aid = store
        .get(KEY_AID)
        .unwrap_or_else(|| defaults.aid().to_string());
    let identifier = store
        .get(KEY_IDENTIFIER)
        .unwrap_or_else(|| defaults.identifier().to_string());
    HceConfig::new(&aid, &identifier)
}

pub fn save_hce_config(store: &dyn ConfigStore, config: &HceConfig) -> Result<()> {
    store.set(KEY_AID, config.aid())?;
    store.set(KEY_IDENTIFIER, config.identifier())
}

/// 内存存储 (测试和模拟模式)
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// TOML 文件存储
///
/// 每次 `set` 都整体写回文件；写入量很小，不做缓冲。
#[derive(Debug)]
pub struct TomlConfigStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl TomlConfigStore {
    /// 默认路径: `~/.config/duolink/store.toml`
    pub fn default_path() -> PathBuf {
        config_dir().join("store.toml")
    }

    pub fn open(path: PathBuf) -> Result<Self> {
        let values = if path.exists() {
            let content = fs::read_to_string(&path)?;
            toml::from_str(&content)
                .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?
        } else {
            BTreeMap::new()
        };
        debug!("Opened config store {:?} ({} keys)", path, values.len());
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }
}

impl ConfigStore for TomlConfigStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value.to_string());

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(&*values)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        fs::write(&self.path, content)?;
        Ok(())
    }
}

/// 应用设置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// 广播中的设备名称
    pub device_name: String,
    /// 交换服务 UUID，同时用作特征 UUID
    pub service_uuid: Uuid,
    /// 扫描响应中服务数据的载荷 (十六进制)
    pub scan_response_hex: String,
    pub advertise_mode: AdvertiseMode,
    pub tx_power: TxPowerLevel,
    /// 是否在 GET DATA 时写入调试记录
    pub record_last_read: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            device_name: get_default_device_name(),
            service_uuid: DEFAULT_SERVICE_UUID,
            scan_response_hex: String::new(),
            advertise_mode: AdvertiseMode::Balanced,
            tx_power: TxPowerLevel::High,
            record_last_read: false,
        }
    }
}

impl AppSettings {
    fn config_path() -> PathBuf {
        config_dir().join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        let path = Self::config_path();
        if path.exists() {
            match fs::read_to_string(&path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        fs::write(&path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn scan_response_payload(&self) -> Result<Vec<u8>> {
        decode_hex(&self.scan_response_hex)
            .map_err(|e| Error::InvalidConfig(format!("scan_response_hex: {}", e)))
    }
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("duolink")
}

/// 获取默认设备名称（主机名）
fn get_default_device_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "Duolink".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hce_config_normalizes() {
        let config = HceConfig::new("f00000000a0101", "12345678-1234-5678-1234-567812345678")
            .unwrap();
        assert_eq!(config.aid(), "F00000000A0101");
        assert_eq!(config.identifier(), "12345678123456781234567812345678");
        assert_eq!(config.aid_bytes().len(), 7);
        assert_eq!(config.identifier_bytes().len(), IDENTIFIER_LEN);
    }

    #[test]
    fn test_hce_config_rejects_odd_aid() {
        let err = HceConfig::new("F00000000A010", "12345678123456781234567812345678");
        assert!(matches!(err, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_hce_config_rejects_short_identifier() {
        let err = HceConfig::new("F00000000A0101", "1234");
        assert!(matches!(err, Err(Error::InvalidIdentifier(_))));
    }

    #[test]
    fn test_store_roundtrip_through_keys() {
        let store = MemoryConfigStore::new();
        assert_eq!(load_hce_config(&store).unwrap(), HceConfig::default());

        let config = HceConfig::new("A0000000031010", "00112233445566778899AABBCCDDEEFF").unwrap();
        save_hce_config(&store, &config).unwrap();
        assert_eq!(store.get(KEY_AID).as_deref(), Some("A0000000031010"));
        assert_eq!(load_hce_config(&store).unwrap(), config);
    }

    #[test]
    fn test_hce_config_serde_validates() {
        let ok: HceConfig =
            toml::from_str("aid = \"F00000000A0101\"\nuuid = \"12345678123456781234567812345678\"")
                .unwrap();
        assert_eq!(ok, HceConfig::default());

        let bad = toml::from_str::<HceConfig>("aid = \"F0F\"\nuuid = \"00\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_toml_store_persists() {
        let dir = std::env::temp_dir().join(format!("duolink-test-{}", Uuid::new_v4()));
        let path = dir.join("store.toml");

        let store = TomlConfigStore::open(path.clone()).unwrap();
        store.set(KEY_AID, "F00000000A0101").unwrap();

        let reopened = TomlConfigStore::open(path).unwrap();
        assert_eq!(reopened.get(KEY_AID).as_deref(), Some("F00000000A0101"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_default_settings() {
        let settings = AppSettings::default();
        assert_eq!(settings.service_uuid, DEFAULT_SERVICE_UUID);
        assert_eq!(settings.advertise_mode, AdvertiseMode::Balanced);
        assert_eq!(settings.tx_power, TxPowerLevel::High);
        assert!(settings.scan_response_payload().unwrap().is_empty());
    }
}
