//! BLE 广播参数和 Legacy 广播数据编码
//!
//! 广播分为两块：
//! - 广播包: Flags + 设备名称 + 发射功率
//! - 扫描响应: 发射功率 + 以服务 UUID 标记的载荷 (Service Data, 128-bit)
//!
//! Legacy 广播每块最多 31 字节，超出时在调用硬件之前直接返回
//! [`AdvertiseErrorCode::DataTooLarge`]。

use crate::error::AdvertiseErrorCode;
use log::trace;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Legacy 广播单块数据上限
pub const LEGACY_ADV_MAX_LEN: usize = 31;

const AD_TYPE_FLAGS: u8 = 0x01;
const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;
const AD_TYPE_TX_POWER_LEVEL: u8 = 0x0A;
const AD_TYPE_SERVICE_DATA_128: u8 = 0x21;

/// LE General Discoverable + BR/EDR Not Supported
const FLAGS_GENERAL_DISCOVERABLE: u8 = 0x06;

/// 广播间隔档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdvertiseMode {
    LowPower,
    #[default]
    Balanced,
    LowLatency,
}

impl AdvertiseMode {
    pub fn interval(self) -> Duration {
        match self {
            AdvertiseMode::LowPower => Duration::from_millis(1000),
            AdvertiseMode::Balanced => Duration::from_millis(250),
            AdvertiseMode::LowLatency => Duration::from_millis(100),
        }
    }
}

/// 发射功率档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TxPowerLevel {
    UltraLow,
    Low,
    Medium,
    #[default]
    High,
}

impl TxPowerLevel {
    pub fn dbm(self) -> i8 {
        match self {
            TxPowerLevel::UltraLow => -21,
            TxPowerLevel::Low => -15,
            TxPowerLevel::Medium => -7,
            TxPowerLevel::High => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertiseSettings {
    pub connectable: bool,
    /// `None` 表示不自动停止
    pub timeout: Option<Duration>,
    pub mode: AdvertiseMode,
    pub tx_power: TxPowerLevel,
}

impl Default for AdvertiseSettings {
    fn default() -> Self {
        Self {
            connectable: true,
            timeout: None,
            mode: AdvertiseMode::Balanced,
            tx_power: TxPowerLevel::High,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertiseData {
    pub include_device_name: bool,
    pub include_tx_power: bool,
    pub service_data: Option<(Uuid, Vec<u8>)>,
}

/// 一次广播会话的全部参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralAdvertisement {
    pub device_name: String,
    pub service_uuid: Uuid,
    pub settings: AdvertiseSettings,
    pub advertise_data: AdvertiseData,
    pub scan_response: AdvertiseData,
}

impl PeripheralAdvertisement {
    /// 可连接、不超时、平衡模式、高功率
    pub fn new(device_name: &str, service_uuid: Uuid, scan_response_payload: &[u8]) -> Self {
        Self {
            device_name: device_name.to_string(),
            service_uuid,
            settings: AdvertiseSettings::default(),
            advertise_data: AdvertiseData {
                include_device_name: true,
                include_tx_power: true,
                service_data: None,
            },
            scan_response: AdvertiseData {
                include_device_name: false,
                include_tx_power: true,
                service_data: Some((service_uuid, scan_response_payload.to_vec())),
            },
        }
    }

    pub fn with_settings(mut self, settings: AdvertiseSettings) -> Self {
        self.settings = settings;
        self
    }

    /// 广播包 AD 结构
    pub fn encode_advertise_data(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LEGACY_ADV_MAX_LEN);
        if self.settings.connectable {
            push_ad(&mut out, AD_TYPE_FLAGS, &[FLAGS_GENERAL_DISCOVERABLE]);
        }
        self.encode_block(&self.advertise_data, &mut out);
        out
    }

    /// 扫描响应 AD 结构
    pub fn encode_scan_response(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LEGACY_ADV_MAX_LEN);
        self.encode_block(&self.scan_response, &mut out);
        out
    }

    fn encode_block(&self, data: &AdvertiseData, out: &mut Vec<u8>) {
        if data.include_device_name && !self.device_name.is_empty() {
            push_ad(out, AD_TYPE_COMPLETE_LOCAL_NAME, self.device_name.as_bytes());
        }
        if data.include_tx_power {
            push_ad(
                out,
                AD_TYPE_TX_POWER_LEVEL,
                &self.settings.tx_power.dbm().to_le_bytes(),
            );
        }
        if let Some((uuid, payload)) = &data.service_data {
            // 128-bit UUID 在空中以小端序传输
            let mut value: Vec<u8> = uuid.as_bytes().iter().rev().copied().collect();
            value.extend_from_slice(payload);
            push_ad(out, AD_TYPE_SERVICE_DATA_128, &value);
        }
    }

    /// 检查两块数据是否都在 Legacy 广播上限内
    pub fn validate(&self) -> Result<(), AdvertiseErrorCode> {
        let adv = self.encode_advertise_data();
        let scan = self.encode_scan_response();
        trace!("Adv data: {:02x?}", adv);
        trace!("Scan response: {:02x?}", scan);
        if adv.len() > LEGACY_ADV_MAX_LEN || scan.len() > LEGACY_ADV_MAX_LEN {
            log::warn!(
                "Advertising payload too large: adv_data={} bytes, scan_rsp={} bytes",
                adv.len(),
                scan.len()
            );
            return Err(AdvertiseErrorCode::DataTooLarge);
        }
        Ok(())
    }
}

/// 追加一个 AD 结构: `[len, type, data...]`
fn push_ad(out: &mut Vec<u8>, ad_type: u8, data: &[u8]) {
    let len = u8::try_from(data.len() + 1).unwrap_or(u8::MAX);
    out.push(len);
    out.push(ad_type);
    out.extend_from_slice(data);
}
