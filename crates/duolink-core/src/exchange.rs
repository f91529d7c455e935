//! 标识符交换
//!
//! 高层 API，把 BLE 外设、卡模拟和读卡端组合在一起：
//! 1. `setup_peripheral`: 权限 -> 适配器 -> 广播 -> 广播成功后注册交换服务
//! 2. `send` / `poll_received`: 通过交换特征收发文本
//! 3. `configure_hce`: 持久化并热替换卡模拟配置
//! 4. `send_over_nfc_reader`: 读取对端卡模拟出的标识符

use crate::ble::{
    AdvertiseOutcome, AdvertiseSettings, BlePeripheralManager, CharacteristicDescriptor,
    ConnectionRecord, GattServiceDescriptor, PeripheralBackend,
};
use crate::ble::backend::AdapterStatus;
use crate::config::{AppSettings, ConfigStore, HceConfig, load_hce_config, save_hce_config};
use crate::events::{EventSink, ExchangeEvent};
use crate::nfc::apdu::decode_hex;
use crate::nfc::hce::{ApduHandler, HceDispatcher};
use crate::nfc::reader::{DiscoveredTag, NfcReader, ReaderProvider};
use crate::permissions::{Permission, PermissionGate};
use crate::{Error, Result};
use log::{debug, info, warn};
use std::sync::Arc;
use uuid::Uuid;

pub struct IdentifierExchange {
    settings: AppSettings,
    store: Arc<dyn ConfigStore>,
    permissions: Arc<dyn PermissionGate>,
    events: EventSink,
    peripheral: BlePeripheralManager,
    hce: Arc<HceDispatcher>,
    reader: NfcReader,
}

impl IdentifierExchange {
    /// 从 `store` 读取卡模拟配置，缺失时使用默认 AID 和标识符
    pub fn new(
        backend: Arc<dyn PeripheralBackend>,
        permissions: Arc<dyn PermissionGate>,
        store: Arc<dyn ConfigStore>,
        settings: AppSettings,
        events: EventSink,
    ) -> Result<Self> {
        let hce_config = load_hce_config(store.as_ref())?;
        info!(
            "Loaded HCE config: aid={}, identifier={}",
            hce_config.aid(),
            hce_config.identifier()
        );

        let mut hce = HceDispatcher::new(hce_config);
        if settings.record_last_read {
            hce = hce.with_last_read_recorder(store.clone());
        }

        let peripheral =
            BlePeripheralManager::new(backend, permissions.clone(), events.clone())
                .with_advertise_settings(AdvertiseSettings {
                    mode: settings.advertise_mode,
                    tx_power: settings.tx_power,
                    ..Default::default()
                });

        Ok(Self {
            settings,
            store,
            permissions,
            reader: NfcReader::new(events.clone()),
            events,
            peripheral,
            hce: Arc::new(hce),
        })
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn peripheral(&self) -> &BlePeripheralManager {
        &self.peripheral
    }

    /// 一次完成外设初始化、广播和服务注册
    ///
    /// 已在广播且服务已注册时什么也不做。
    pub async fn setup_peripheral(&self) -> Result<()> {
        let uuid = self.settings.service_uuid;
        if self.peripheral.is_advertising().await
            && self.peripheral.get_characteristic(uuid, uuid).await.is_some()
        {
            debug!("Peripheral already set up");
            return Ok(());
        }

        let result = self.try_setup_peripheral(uuid).await;
        if let Err(e) = &result {
            self.events.send(ExchangeEvent::from_error(e));
        }
        result
    }

    async fn try_setup_peripheral(&self, uuid: Uuid) -> Result<()> {
        if self.peripheral.init().await? == AdapterStatus::Disabled
            && self.peripheral.adapter_status().await? == AdapterStatus::Disabled
        {
            return Err(Error::AdapterDisabled);
        }

        let payload = self.settings.scan_response_payload()?;
        match self
            .peripheral
            .start_advertising(&self.settings.device_name, uuid, &payload)
            .await?
        {
            AdvertiseOutcome::Started => {}
            AdvertiseOutcome::Failed(code) => return Err(Error::AdvertiseFailure(code)),
        }

        // 注册失败时撤销广播，下一次 setup 从头开始
        let registered = self
            .peripheral
            .add_service(GattServiceDescriptor::exchange_service(uuid))
            .await;
        if registered.is_err() {
            if let Err(e) = self.peripheral.stop_advertising().await {
                warn!("Failed to stop advertising after registration failure: {}", e);
            }
        }
        registered
    }

    pub async fn start_advertising(
        &self,
        name: &str,
        service_uuid: Uuid,
        scan_response_payload: &[u8],
    ) -> Result<AdvertiseOutcome> {
        self.peripheral
            .start_advertising(name, service_uuid, scan_response_payload)
            .await
    }

    pub async fn stop_advertising(&self) -> Result<()> {
        self.peripheral.stop_advertising().await
    }

    pub async fn add_service(&self, service: GattServiceDescriptor) -> Result<()> {
        self.peripheral.add_service(service).await
    }

    pub async fn notify(&self, peer: &str, characteristic: Uuid, payload: &[u8]) -> Result<bool> {
        self.peripheral.notify(peer, characteristic, payload).await
    }

    pub async fn get_characteristic(
        &self,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
    ) -> Option<CharacteristicDescriptor> {
        self.peripheral
            .get_characteristic(service_uuid, characteristic_uuid)
            .await
    }

    /// 通知最早连接的对端
    ///
    /// 服务未注册或没有连接的对端时返回 `false`。
    pub async fn send(&self, message: &str) -> Result<bool> {
        let uuid = self.settings.service_uuid;
        let Some(characteristic) = self.peripheral.get_characteristic(uuid, uuid).await else {
            warn!("Exchange service not registered, message dropped");
            return Ok(false);
        };
        let Some(peer) = self.peripheral.first_peer() else {
            warn!("No connected peer, message dropped");
            return Ok(false);
        };

        debug!("Sending {} bytes to {}", message.len(), peer.address);
        self.peripheral
            .notify(&peer.address, characteristic.uuid, message.as_bytes())
            .await
    }

    pub fn poll_received(&self) -> Option<String> {
        self.peripheral.poll_received()
    }

    pub fn connected_peers(&self) -> Vec<ConnectionRecord> {
        self.peripheral.connected_peers()
    }

    /// 校验、持久化并启用新的卡模拟配置
    pub fn configure_hce(&self, aid: &str, identifier: &str) -> Result<()> {
        let config = HceConfig::new(aid, identifier)?;
        self.start_hce(config)
    }

    pub fn start_hce(&self, config: HceConfig) -> Result<()> {
        save_hce_config(self.store.as_ref(), &config)?;
        self.hce.configure(config);
        self.hce.set_enabled(true);
        Ok(())
    }

    pub fn stop_hce(&self) {
        self.hce.set_enabled(false);
    }

    pub fn hce_config(&self) -> Arc<HceConfig> {
        self.hce.config()
    }

    /// 卡模拟分发器，交给平台的 HCE 服务或 [`LoopbackTag`](crate::nfc::LoopbackTag)
    pub fn hce(&self) -> Arc<HceDispatcher> {
        self.hce.clone()
    }

    pub fn handle_apdu(&self, apdu: &[u8]) -> Vec<u8> {
        self.hce.handle_command(apdu)
    }

    pub async fn check_nfc_reader(&self, provider: &dyn ReaderProvider) -> Result<()> {
        self.reader.check_status(provider).await
    }

    /// 对发现的标签执行读卡交换，返回 8-4-4-4-12 格式的标识符
    ///
    /// `message` 非空时按十六进制解码，附加在 GET DATA 命令后面。
    /// SELECT 使用当前卡模拟配置中的 AID。
    pub async fn send_over_nfc_reader(&self, tag: DiscoveredTag, message: &str) -> Result<String> {
        if let Err(e) = self.permissions.check(&[Permission::Nfc]) {
            self.events.send(ExchangeEvent::from_error(&e));
            return Err(e);
        }

        let selector = if message.trim().is_empty() {
            None
        } else {
            match decode_hex(message) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    let err = Error::InvalidConfig(format!("selector '{}': {}", message, e));
                    self.events.send(ExchangeEvent::from_error(&err));
                    return Err(err);
                }
            }
        };

        let aid = self.hce.config().aid_bytes();
        self.reader.exchange(tag, &aid, selector.as_deref()).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.hce.set_enabled(false);
        self.peripheral.shutdown().await
    }
}
