//! 进程内模拟 BLE 协议栈
//!
//! 不需要任何硬件，测试和 `duolink demo` 使用。模拟中心端可以连接、写入、
//! 订阅和断开；外设发出的通知被记录下来供检查。

use crate::ble::adv::PeripheralAdvertisement;
use crate::ble::backend::{AdapterStatus, HardwareEvent, HardwareEventSender, PeripheralBackend};
use crate::ble::connection::ConnectionState;
use crate::ble::gatt::{CharacteristicProperties, GattServiceDescriptor};
use crate::error::AdvertiseErrorCode;
use crate::{Error, Result};
use async_trait::async_trait;
use log::{debug, info};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// 外设发出的一次通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub peer: String,
    pub characteristic: Uuid,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct SimState {
    /// `None` 表示没有适配器
    adapter: Option<AdapterStatus>,
    enable_requested: bool,
    advertisement: Option<PeripheralAdvertisement>,
    next_advertise_failure: Option<AdvertiseErrorCode>,
    reject_registration: bool,
    next_stop_failure: Option<String>,
    service: Option<GattServiceDescriptor>,
    events: Option<HardwareEventSender>,
    servers_opened: usize,
    subscribed: HashSet<Uuid>,
    notifications: Vec<SentNotification>,
}

#[derive(Debug)]
pub struct SimulatedBackend {
    state: Mutex<SimState>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    /// 已打开的适配器
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                adapter: Some(AdapterStatus::Enabled),
                ..Default::default()
            }),
        }
    }

    pub fn without_adapter() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
        }
    }

    pub fn with_adapter_disabled() -> Self {
        Self {
            state: Mutex::new(SimState {
                adapter: Some(AdapterStatus::Disabled),
                ..Default::default()
            }),
        }
    }

    /// 下一次 `start_advertising` 以指定错误码失败
    pub fn fail_next_advertise(&self, code: AdvertiseErrorCode) {
        self.lock().next_advertise_failure = Some(code);
    }

    /// 为 `true` 时之后的服务注册都返回 `false`
    pub fn reject_service_registration(&self, reject: bool) {
        self.lock().reject_registration = reject;
    }

    /// 下一次 `stop_advertising` 以 IO 错误失败，广播保持
    pub fn fail_next_stop(&self, reason: &str) {
        self.lock().next_stop_failure = Some(reason.to_string());
    }

    pub fn enable_requested(&self) -> bool {
        self.lock().enable_requested
    }

    pub fn advertisement(&self) -> Option<PeripheralAdvertisement> {
        self.lock().advertisement.clone()
    }

    pub fn registered_service(&self) -> Option<GattServiceDescriptor> {
        self.lock().service.clone()
    }

    /// 累计打开过的 GATT Server 数量
    pub fn servers_opened(&self) -> usize {
        self.lock().servers_opened
    }

    pub fn notifications(&self) -> Vec<SentNotification> {
        self.lock().notifications.clone()
    }

    pub fn connect_peer(&self, address: &str, name: Option<&str>) {
        self.emit(HardwareEvent::ConnectionStateChanged {
            address: address.to_string(),
            name: name.map(str::to_string),
            state: ConnectionState::Connected,
        });
    }

    pub fn disconnect_peer(&self, address: &str) {
        self.emit(HardwareEvent::ConnectionStateChanged {
            address: address.to_string(),
            name: None,
            state: ConnectionState::Disconnected,
        });
    }

    /// 模拟中心端写特征，返回链路层确认
    ///
    /// 只要服务已注册就立即确认，内容是否有效与确认无关。
    pub fn write(&self, address: &str, characteristic: Uuid, value: &[u8]) -> bool {
        let acknowledged = self.lock().events.is_some();
        self.emit(HardwareEvent::CharacteristicWrite {
            address: address.to_string(),
            characteristic,
            value: value.to_vec(),
        });
        acknowledged
    }

    /// 模拟中心端写 CCCD 开启通知
    pub fn subscribe(&self, characteristic: Uuid) {
        self.lock().subscribed.insert(characteristic);
        self.emit(HardwareEvent::NotificationsEnabled { characteristic });
    }

    /// 模拟中心端关闭通知，未订阅时什么也不做
    pub fn unsubscribe(&self, characteristic: Uuid) {
        if self.lock().subscribed.remove(&characteristic) {
            self.emit(HardwareEvent::NotificationsDisabled { characteristic });
        }
    }

    pub fn is_subscribed(&self, characteristic: Uuid) -> bool {
        self.lock().subscribed.contains(&characteristic)
    }

    fn emit(&self, event: HardwareEvent) {
        let sender = self.lock().events.clone();
        match sender {
            Some(tx) => {
                if tx.send(event).is_err() {
                    debug!("Simulated event dropped: dispatcher stopped");
                }
            }
            None => debug!("Simulated event dropped: no GATT server"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PeripheralBackend for SimulatedBackend {
    async fn adapter_status(&self) -> Result<AdapterStatus> {
        self.lock().adapter.ok_or(Error::AdapterUnavailable)
    }

    async fn request_enable(&self) {
        let mut state = self.lock();
        state.enable_requested = true;
        if state.adapter.is_some() {
            state.adapter = Some(AdapterStatus::Enabled);
        }
    }

    async fn start_advertising(
        &self,
        advertisement: &PeripheralAdvertisement,
    ) -> std::result::Result<(), AdvertiseErrorCode> {
        advertisement.validate()?;
        let mut state = self.lock();
        if let Some(code) = state.next_advertise_failure.take() {
            return Err(code);
        }
        if state.advertisement.is_some() {
            return Err(AdvertiseErrorCode::AlreadyStarted);
        }
        info!(
            "Simulated advertising started: name='{}', service_uuid={}",
            advertisement.device_name, advertisement.service_uuid
        );
        state.advertisement = Some(advertisement.clone());
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        let mut state = self.lock();
        if let Some(reason) = state.next_stop_failure.take() {
            return Err(Error::Io(reason));
        }
        state.advertisement = None;
        Ok(())
    }

    async fn open_gatt_server(
        &self,
        service: &GattServiceDescriptor,
        events: HardwareEventSender,
    ) -> Result<bool> {
        let mut state = self.lock();
        state.servers_opened += 1;
        if state.reject_registration {
            return Ok(false);
        }
        state.service = Some(service.clone());
        state.events = Some(events);
        Ok(true)
    }

    async fn close_gatt_server(&self) {
        let mut state = self.lock();
        state.service = None;
        state.events = None;
        state.subscribed.clear();
    }

    async fn notify(&self, peer: &str, characteristic: Uuid, payload: &[u8]) -> Result<bool> {
        let mut state = self.lock();
        let notifiable = state
            .service
            .as_ref()
            .and_then(|s| s.characteristic(characteristic))
            .is_some_and(|c| {
                c.properties.contains(CharacteristicProperties::NOTIFY)
                    || c.properties.contains(CharacteristicProperties::INDICATE)
            });
        if !notifiable {
            return Ok(false);
        }
        state.notifications.push(SentNotification {
            peer: peer.to_string(),
            characteristic,
            payload: payload.to_vec(),
        });
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_subscription_events() {
        let backend = SimulatedBackend::new();
        let uuid = Uuid::from_u128(0x1234);
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(
            backend
                .open_gatt_server(&GattServiceDescriptor::exchange_service(uuid), tx)
                .await
                .unwrap()
        );

        backend.subscribe(uuid);
        assert!(backend.is_subscribed(uuid));
        backend.unsubscribe(uuid);
        backend.unsubscribe(uuid);
        assert!(!backend.is_subscribed(uuid));

        assert_eq!(
            rx.try_recv().unwrap(),
            HardwareEvent::NotificationsEnabled {
                characteristic: uuid
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            HardwareEvent::NotificationsDisabled {
                characteristic: uuid
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_failure_keeps_advertisement() {
        let backend = SimulatedBackend::new();
        backend.fail_next_stop("adapter busy");
        backend.lock().advertisement = Some(PeripheralAdvertisement::new(
            "sim",
            Uuid::from_u128(0x1234),
            &[],
        ));

        assert!(backend.stop_advertising().await.is_err());
        assert!(backend.advertisement().is_some());
        backend.stop_advertising().await.unwrap();
        assert!(backend.advertisement().is_none());
    }
}
