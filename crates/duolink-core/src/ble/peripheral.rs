//! BLE 外设管理器
//!
//! 持有后端、连接跟踪和接收队列。硬件回调经 [`HardwareEvent`] 通道送到
//! 单一的分发任务，分发任务更新连接集合、把写入放入接收队列，并在事件通道上
//! 发出对应的结构化事件。
//!
//! 每个管理器同一时刻最多一个广播会话、一个 GATT Server。

use crate::ble::adv::{AdvertiseSettings, PeripheralAdvertisement};
use crate::ble::backend::{AdapterStatus, HardwareEvent, PeripheralBackend};
use crate::ble::connection::{ConnectionRecord, ConnectionTracker};
use crate::ble::gatt::{CharacteristicDescriptor, GattServiceDescriptor};
use crate::ble::queue::ReceiveQueue;
use crate::error::AdvertiseErrorCode;
use crate::events::{EventSink, ExchangeEvent};
use crate::permissions::{Permission, PermissionGate};
use crate::{Error, Result};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// 广播启动结果
///
/// 失败不作为 `Err` 返回：调用方只能在拿到 `Started` 之后认为广播已生效。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertiseOutcome {
    Started,
    Failed(AdvertiseErrorCode),
}

impl AdvertiseOutcome {
    pub fn is_started(self) -> bool {
        self == AdvertiseOutcome::Started
    }
}

#[derive(Default)]
struct ManagerState {
    initialized: bool,
    advertising: Option<PeripheralAdvertisement>,
    service: Option<GattServiceDescriptor>,
    dispatcher: Option<JoinHandle<()>>,
}

pub struct BlePeripheralManager {
    backend: Arc<dyn PeripheralBackend>,
    permissions: Arc<dyn PermissionGate>,
    events: EventSink,
    settings: AdvertiseSettings,
    tracker: Arc<ConnectionTracker>,
    queue: Arc<ReceiveQueue>,
    state: Mutex<ManagerState>,
}

impl BlePeripheralManager {
    pub fn new(
        backend: Arc<dyn PeripheralBackend>,
        permissions: Arc<dyn PermissionGate>,
        events: EventSink,
    ) -> Self {
        Self {
            backend,
            permissions,
            events,
            settings: AdvertiseSettings::default(),
            tracker: Arc::new(ConnectionTracker::new()),
            queue: Arc::new(ReceiveQueue::new()),
            state: Mutex::default(),
        }
    }

    /// 覆盖默认广播参数（可连接、不超时、平衡模式、高功率）
    pub fn with_advertise_settings(mut self, settings: AdvertiseSettings) -> Self {
        self.settings = settings;
        self
    }

    /// 解析适配器
    ///
    /// 适配器存在但未打开时发出打开请求并返回 `Disabled`，
    /// 请求结果要通过之后的 [`adapter_status`](Self::adapter_status) 观察。
    pub async fn init(&self) -> Result<AdapterStatus> {
        self.permissions.check(&Permission::PERIPHERAL)?;

        let status = self.backend.adapter_status().await?;
        if status == AdapterStatus::Disabled {
            info!("Bluetooth adapter is off, requesting enable");
            self.backend.request_enable().await;
        }
        self.state.lock().await.initialized = true;
        debug!("Peripheral initialized, adapter {:?}", status);
        Ok(status)
    }

    pub async fn adapter_status(&self) -> Result<AdapterStatus> {
        self.backend.adapter_status().await
    }

    pub async fn start_advertising(
        &self,
        name: &str,
        service_uuid: Uuid,
        scan_response_payload: &[u8],
    ) -> Result<AdvertiseOutcome> {
        self.permissions.check(&Permission::PERIPHERAL)?;

        let mut state = self.state.lock().await;
        if !state.initialized {
            return Err(Error::NotInitialized);
        }

        let outcome = if state.advertising.is_some() {
            Err(AdvertiseErrorCode::AlreadyStarted)
        } else {
            let advertisement =
                PeripheralAdvertisement::new(name, service_uuid, scan_response_payload)
                    .with_settings(self.settings.clone());
            let started = self.backend.start_advertising(&advertisement).await;
            started.map(|()| advertisement)
        };

        match outcome {
            Ok(advertisement) => {
                info!(
                    "Advertising started: name='{}', service_uuid={}",
                    name, service_uuid
                );
                state.advertising = Some(advertisement);
                self.events.send(ExchangeEvent::AdvertisingStarted);
                Ok(AdvertiseOutcome::Started)
            }
            Err(code) => {
                error!("Advertising failed: {}", code);
                self.events
                    .send(ExchangeEvent::AdvertisingFailed { code: code.code() });
                Ok(AdvertiseOutcome::Failed(code))
            }
        }
    }

    /// 未在广播时什么也不做
    pub async fn stop_advertising(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.advertising.is_some() {
            self.backend.stop_advertising().await?;
            state.advertising = None;
            info!("Advertising stopped");
        }
        Ok(())
    }

    pub async fn is_advertising(&self) -> bool {
        self.state.lock().await.advertising.is_some()
    }

    /// 打开 GATT Server 并注册服务
    ///
    /// 已有 Server 时先关闭旧的。注册结果为 `false` 时返回
    /// `Error::ServiceRegistrationFailure`，整个交换能力视为不可用。
    pub async fn add_service(&self, service: GattServiceDescriptor) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.initialized {
            return Err(Error::NotInitialized);
        }

        if state.service.take().is_some() {
            debug!("Closing previous GATT server");
            self.backend.close_gatt_server().await;
            self.tracker.clear();
        }
        if let Some(dispatcher) = state.dispatcher.take() {
            dispatcher.abort();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let registered = self.backend.open_gatt_server(&service, tx).await?;
        info!(
            "GATT service {} registration: success={}",
            service.uuid, registered
        );
        self.events.send(ExchangeEvent::ServiceAdded {
            uuid: service.uuid,
            success: registered,
        });

        if !registered {
            self.backend.close_gatt_server().await;
            return Err(Error::ServiceRegistrationFailure(format!(
                "service {} was rejected by the stack",
                service.uuid
            )));
        }

        state.dispatcher = Some(tokio::spawn(dispatch_hardware_events(
            rx,
            self.tracker.clone(),
            self.queue.clone(),
            self.events.clone(),
        )));
        state.service = Some(service);
        Ok(())
    }

    /// 向已连接的对端发送通知
    ///
    /// 对端未被跟踪或特征不存在时返回 `false`。载荷长度由调用方负责。
    pub async fn notify(&self, peer: &str, characteristic: Uuid, payload: &[u8]) -> Result<bool> {
        self.permissions.check(&[Permission::BluetoothConnect])?;

        let known = {
            let state = self.state.lock().await;
            state
                .service
                .as_ref()
                .is_some_and(|s| s.characteristic(characteristic).is_some())
        };
        if !known {
            warn!("Notify on unknown characteristic {}", characteristic);
            return Ok(false);
        }
        if !self.tracker.is_connected(peer) {
            warn!("Notify target {} is not connected", peer);
            return Ok(false);
        }

        self.backend.notify(peer, characteristic, payload).await
    }

    /// 服务从未注册时返回 `None`
    pub async fn get_characteristic(
        &self,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
    ) -> Option<CharacteristicDescriptor> {
        let state = self.state.lock().await;
        state
            .service
            .as_ref()
            .filter(|s| s.uuid == service_uuid)
            .and_then(|s| s.characteristic(characteristic_uuid))
            .cloned()
    }

    pub async fn service(&self) -> Option<GattServiceDescriptor> {
        self.state.lock().await.service.clone()
    }

    /// 取出最早收到的一条消息，队列为空时返回 `None`
    pub fn poll_received(&self) -> Option<String> {
        self.queue.poll()
    }

    pub fn connected_peers(&self) -> Vec<ConnectionRecord> {
        self.tracker.peers()
    }

    /// 通知目标：最早连接且仍在线的对端
    pub fn first_peer(&self) -> Option<ConnectionRecord> {
        self.tracker.first()
    }

    /// 停止广播并关闭 GATT Server
    pub async fn shutdown(&self) -> Result<()> {
        self.stop_advertising().await?;

        let mut state = self.state.lock().await;
        if state.service.take().is_some() {
            self.backend.close_gatt_server().await;
        }
        if let Some(dispatcher) = state.dispatcher.take() {
            dispatcher.abort();
        }
        self.tracker.clear();
        info!("Peripheral shut down");
        Ok(())
    }
}

/// 硬件事件的唯一消费者
async fn dispatch_hardware_events(
    mut rx: mpsc::UnboundedReceiver<HardwareEvent>,
    tracker: Arc<ConnectionTracker>,
    queue: Arc<ReceiveQueue>,
    events: EventSink,
) {
    while let Some(event) = rx.recv().await {
        match event {
            HardwareEvent::ConnectionStateChanged {
                address,
                name,
                state,
            } => {
                let event = tracker.apply(&address, name, state);
                events.send(event);
            }
            HardwareEvent::CharacteristicWrite {
                address,
                characteristic,
                value,
            } => {
                debug!(
                    "Write request: peer={}, characteristic={}, len={}",
                    address,
                    characteristic,
                    value.len()
                );
                if let Some(message) = queue.on_write(&value) {
                    events.send(ExchangeEvent::Received { message });
                }
            }
            HardwareEvent::CharacteristicRead {
                address,
                characteristic,
                offset,
            } => {
                debug!(
                    "Read request: peer={}, characteristic={}, offset={}",
                    address, characteristic, offset
                );
            }
            HardwareEvent::DescriptorWrite { descriptor, value } => {
                debug!(
                    "Descriptor write: descriptor={}, value={:02X?}",
                    descriptor, value
                );
            }
            HardwareEvent::NotificationsEnabled { characteristic } => {
                info!("Notifications enabled on {}", characteristic);
            }
            HardwareEvent::NotificationsDisabled { characteristic } => {
                info!("Notifications disabled on {}", characteristic);
            }
        }
    }
    debug!("Hardware event dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::DEFAULT_SERVICE_UUID;
    use crate::ble::simulated::SimulatedBackend;
    use crate::events;
    use crate::permissions::StaticPermissions;
    use std::time::Duration;

    const PEER: &str = "11:22:33:44:55:66";

    fn new_manager(
        backend: Arc<SimulatedBackend>,
        permissions: StaticPermissions,
    ) -> (
        BlePeripheralManager,
        mpsc::UnboundedReceiver<ExchangeEvent>,
    ) {
        let (sink, rx) = events::channel();
        (
            BlePeripheralManager::new(backend, Arc::new(permissions), sink),
            rx,
        )
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ExchangeEvent>) -> ExchangeEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event timeout")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_init_without_adapter() {
        let backend = Arc::new(SimulatedBackend::without_adapter());
        let (manager, _rx) = new_manager(backend, StaticPermissions::granted());
        assert!(matches!(manager.init().await, Err(Error::AdapterUnavailable)));
    }

    #[tokio::test]
    async fn test_init_requests_enable_when_disabled() {
        let backend = Arc::new(SimulatedBackend::with_adapter_disabled());
        let (manager, _rx) = new_manager(backend.clone(), StaticPermissions::granted());

        assert_eq!(manager.init().await.unwrap(), AdapterStatus::Disabled);
        assert!(backend.enable_requested());
        assert_eq!(
            manager.adapter_status().await.unwrap(),
            AdapterStatus::Enabled
        );
    }

    #[tokio::test]
    async fn test_permission_checked_before_hardware() {
        let backend = Arc::new(SimulatedBackend::new());
        let permissions = StaticPermissions::granted().deny(Permission::BluetoothAdvertise);
        let (manager, _rx) = new_manager(backend.clone(), permissions);

        match manager.init().await {
            Err(Error::PermissionDenied(missing)) => {
                assert_eq!(missing, vec![Permission::BluetoothAdvertise]);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!backend.enable_requested());
    }

    #[tokio::test]
    async fn test_advertise_requires_init() {
        let backend = Arc::new(SimulatedBackend::new());
        let (manager, _rx) = new_manager(backend, StaticPermissions::granted());
        let result = manager
            .start_advertising("duo", DEFAULT_SERVICE_UUID, &[])
            .await;
        assert!(matches!(result, Err(Error::NotInitialized)));
    }

    #[tokio::test]
    async fn test_advertise_failure_is_outcome_not_error() {
        let backend = Arc::new(SimulatedBackend::new());
        backend.fail_next_advertise(AdvertiseErrorCode::TooManyAdvertisers);
        let (manager, mut rx) = new_manager(backend, StaticPermissions::granted());
        manager.init().await.unwrap();

        let outcome = manager
            .start_advertising("duo", DEFAULT_SERVICE_UUID, &[1, 2])
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AdvertiseOutcome::Failed(AdvertiseErrorCode::TooManyAdvertisers)
        );
        assert!(!manager.is_advertising().await);
        assert_eq!(
            next_event(&mut rx).await,
            ExchangeEvent::AdvertisingFailed { code: 2 }
        );
    }

    #[tokio::test]
    async fn test_second_advertise_keeps_first_session() {
        let backend = Arc::new(SimulatedBackend::new());
        let (manager, _rx) = new_manager(backend.clone(), StaticPermissions::granted());
        manager.init().await.unwrap();

        assert!(
            manager
                .start_advertising("first", DEFAULT_SERVICE_UUID, &[])
                .await
                .unwrap()
                .is_started()
        );
        let second = manager
            .start_advertising("second", DEFAULT_SERVICE_UUID, &[])
            .await
            .unwrap();
        assert_eq!(
            second,
            AdvertiseOutcome::Failed(AdvertiseErrorCode::AlreadyStarted)
        );
        assert_eq!(backend.advertisement().unwrap().device_name, "first");
    }

    #[tokio::test]
    async fn test_stop_advertising_is_idempotent() {
        let backend = Arc::new(SimulatedBackend::new());
        let (manager, _rx) = new_manager(backend.clone(), StaticPermissions::granted());
        manager.init().await.unwrap();

        manager.stop_advertising().await.unwrap();
        manager
            .start_advertising("duo", DEFAULT_SERVICE_UUID, &[])
            .await
            .unwrap();
        manager.stop_advertising().await.unwrap();
        manager.stop_advertising().await.unwrap();
        assert!(backend.advertisement().is_none());
    }

    #[tokio::test]
    async fn test_failed_stop_keeps_advertising_state() {
        let backend = Arc::new(SimulatedBackend::new());
        let (manager, _rx) = new_manager(backend.clone(), StaticPermissions::granted());
        manager.init().await.unwrap();
        manager
            .start_advertising("duo", DEFAULT_SERVICE_UUID, &[])
            .await
            .unwrap();

        backend.fail_next_stop("adapter busy");
        assert!(matches!(manager.stop_advertising().await, Err(Error::Io(_))));
        assert!(manager.is_advertising().await);
        assert!(backend.advertisement().is_some());

        manager.stop_advertising().await.unwrap();
        assert!(!manager.is_advertising().await);
    }

    #[tokio::test]
    async fn test_rejected_registration_is_hard_failure() {
        let backend = Arc::new(SimulatedBackend::new());
        backend.reject_service_registration(true);
        let (manager, mut rx) = new_manager(backend, StaticPermissions::granted());
        manager.init().await.unwrap();

        let result = manager
            .add_service(GattServiceDescriptor::exchange_service(DEFAULT_SERVICE_UUID))
            .await;
        assert!(matches!(result, Err(Error::ServiceRegistrationFailure(_))));
        assert_eq!(
            next_event(&mut rx).await,
            ExchangeEvent::ServiceAdded {
                uuid: DEFAULT_SERVICE_UUID,
                success: false
            }
        );
        assert!(
            manager
                .get_characteristic(DEFAULT_SERVICE_UUID, DEFAULT_SERVICE_UUID)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_second_add_service_replaces_server() {
        let backend = Arc::new(SimulatedBackend::new());
        let (manager, _rx) = new_manager(backend.clone(), StaticPermissions::granted());
        manager.init().await.unwrap();

        let other = Uuid::from_u128(0xabcd);
        manager
            .add_service(GattServiceDescriptor::exchange_service(DEFAULT_SERVICE_UUID))
            .await
            .unwrap();
        manager
            .add_service(GattServiceDescriptor::exchange_service(other))
            .await
            .unwrap();

        assert_eq!(backend.servers_opened(), 2);
        assert_eq!(backend.registered_service().unwrap().uuid, other);
        assert!(
            manager
                .get_characteristic(DEFAULT_SERVICE_UUID, DEFAULT_SERVICE_UUID)
                .await
                .is_none()
        );
        assert!(manager.get_characteristic(other, other).await.is_some());
    }

    #[tokio::test]
    async fn test_notify_requires_tracked_peer() {
        let backend = Arc::new(SimulatedBackend::new());
        let (manager, mut rx) = new_manager(backend.clone(), StaticPermissions::granted());
        manager.init().await.unwrap();
        manager
            .add_service(GattServiceDescriptor::exchange_service(DEFAULT_SERVICE_UUID))
            .await
            .unwrap();
        let _ = next_event(&mut rx).await;

        assert!(
            !manager
                .notify(PEER, DEFAULT_SERVICE_UUID, b"hi")
                .await
                .unwrap()
        );

        backend.connect_peer(PEER, Some("phone"));
        assert!(matches!(
            next_event(&mut rx).await,
            ExchangeEvent::Connected { .. }
        ));

        assert!(
            manager
                .notify(PEER, DEFAULT_SERVICE_UUID, b"hi")
                .await
                .unwrap()
        );
        assert!(
            !manager
                .notify(PEER, Uuid::from_u128(0x1), b"hi")
                .await
                .unwrap()
        );

        let sent = backend.notifications();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].peer, PEER);
        assert_eq!(sent[0].payload, b"hi");
    }

    #[tokio::test]
    async fn test_invalid_utf8_write_is_acknowledged_but_not_queued() {
        let backend = Arc::new(SimulatedBackend::new());
        let (manager, mut rx) = new_manager(backend.clone(), StaticPermissions::granted());
        manager.init().await.unwrap();
        manager
            .add_service(GattServiceDescriptor::exchange_service(DEFAULT_SERVICE_UUID))
            .await
            .unwrap();
        let _ = next_event(&mut rx).await;

        assert!(backend.write(PEER, DEFAULT_SERVICE_UUID, &[0xC3, 0x28]));
        assert!(backend.write(PEER, DEFAULT_SERVICE_UUID, b"ok"));
        assert_eq!(
            next_event(&mut rx).await,
            ExchangeEvent::Received {
                message: "ok".to_string()
            }
        );
        assert_eq!(manager.poll_received().as_deref(), Some("ok"));
        assert_eq!(manager.poll_received(), None);
    }
}
