//! BLE Central - 连接另一台设备上的交换外设
//!
//! 流程:
//! 1. 扫描，直到发现 Service Data 或服务列表包含交换 UUID 的设备
//! 2. 连接并发现服务
//! 3. 订阅交换特征的通知，转发到返回的通道
//! 4. 通过 write-without-response 发送消息

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral, PeripheralId};
use futures_util::{Stream, StreamExt};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time;
use uuid::Uuid;

/// 默认扫描时长
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(3);

/// BLE 中心端错误
#[derive(Debug, thiserror::Error)]
pub enum BleCentralError {
    #[error("No Bluetooth adapters found")]
    NoAdapter,

    #[error("No peripheral advertising {0}")]
    DeviceNotFound(Uuid),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Not connected")]
    NotConnected,

    #[error("IO error: {0}")]
    IoError(#[from] btleplug::Error),
}

impl From<BleCentralError> for crate::Error {
    fn from(e: BleCentralError) -> Self {
        match e {
            BleCentralError::NoAdapter => crate::Error::AdapterUnavailable,
            other => crate::Error::Io(other.to_string()),
        }
    }
}

struct Link {
    peripheral: PlatformPeripheral,
    characteristic: Characteristic,
}

pub struct BleCentral {
    adapter: Adapter,
    uuid: Uuid,
    link: Mutex<Option<Link>>,
}

impl BleCentral {
    /// 使用第一个可用适配器，`uuid` 同时是服务 UUID 和特征 UUID
    pub async fn new(uuid: Uuid) -> Result<Self, BleCentralError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(BleCentralError::NoAdapter)?;

        Ok(Self {
            adapter,
            uuid,
            link: Mutex::new(None),
        })
    }

    /// 扫描并连接，返回收到的通知文本
    pub async fn connect(
        &self,
        scan_timeout: Duration,
    ) -> Result<mpsc::UnboundedReceiver<String>, BleCentralError> {
        let peripheral = self.find_peripheral(scan_timeout).await?;

        tracing::info!("Connecting to {}", peripheral.address());
        peripheral.connect().await?;

        tracing::info!("Discovering services...");
        peripheral.discover_services().await?;

        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == self.uuid && c.service_uuid == self.uuid)
            .ok_or(BleCentralError::CharacteristicNotFound(self.uuid))?;

        peripheral.subscribe(&characteristic).await?;
        let mut notifications = peripheral.notifications().await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let uuid = self.uuid;
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != uuid {
                    continue;
                }
                match String::from_utf8(notification.value) {
                    Ok(text) => {
                        if tx.send(text).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("Dropping non UTF-8 notification: {}", e),
                }
            }
            tracing::debug!("Notification stream ended");
        });

        tracing::info!("Ble central connected to {}", peripheral.address());
        *self.link.lock().await = Some(Link {
            peripheral,
            characteristic,
        });
        Ok(rx)
    }

    /// 向外设发送消息
    pub async fn send(&self, message: &str) -> Result<(), BleCentralError> {
        let link = self.link.lock().await;
        let link = link.as_ref().ok_or(BleCentralError::NotConnected)?;

        tracing::info!("Ble central sending {} bytes", message.len());
        link.peripheral
            .write(
                &link.characteristic,
                message.as_bytes(),
                WriteType::WithoutResponse,
            )
            .await?;
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        match self.link.lock().await.as_ref() {
            Some(link) => link.peripheral.is_connected().await.unwrap_or(false),
            None => false,
        }
    }

    pub async fn disconnect(&self) -> Result<(), BleCentralError> {
        if let Some(link) = self.link.lock().await.take() {
            link.peripheral.disconnect().await?;
            tracing::info!("Disconnected from {}", link.peripheral.address());
        }
        Ok(())
    }

    async fn find_peripheral(
        &self,
        scan_timeout: Duration,
    ) -> Result<PlatformPeripheral, BleCentralError> {
        let events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;
        tracing::info!(
            "Ble central scanning for {} ({}s)...",
            self.uuid,
            scan_timeout.as_secs()
        );

        let uuid = self.uuid;
        let found = scan_for(events, scan_timeout, |event| advertised_id(event, uuid)).await;

        if let Err(e) = self.adapter.stop_scan().await {
            tracing::warn!("Failed to stop scan: {}", e);
        }

        match found {
            Some(id) => {
                tracing::debug!("Matching advertisement from {:?}", id);
                Ok(self.adapter.peripheral(&id).await?)
            }
            None => self.find_cached().await,
        }
    }

    /// 扫描期间没有收到匹配的事件时，再检查已缓存的设备
    async fn find_cached(&self) -> Result<PlatformPeripheral, BleCentralError> {
        for peripheral in self.adapter.peripherals().await? {
            if let Some(props) = peripheral.properties().await? {
                if props.service_data.contains_key(&self.uuid) || props.services.contains(&self.uuid)
                {
                    tracing::debug!("Found {} in cache", props.address);
                    return Ok(peripheral);
                }
            }
        }
        Err(BleCentralError::DeviceNotFound(self.uuid))
    }
}

/// Service Data 或服务列表包含 `uuid` 的广播
fn advertised_id(event: CentralEvent, uuid: Uuid) -> Option<PeripheralId> {
    match event {
        CentralEvent::ServiceDataAdvertisement { id, service_data }
            if service_data.contains_key(&uuid) =>
        {
            Some(id)
        }
        CentralEvent::ServicesAdvertisement { id, services } if services.contains(&uuid) => {
            Some(id)
        }
        _ => None,
    }
}

/// 消费事件流直到 `matcher` 命中、流结束或超时
///
/// 不做任何可能失败的调用，调用方总能在之后停止扫描。
async fn scan_for<S, T, F>(events: S, scan_timeout: Duration, mut matcher: F) -> Option<T>
where
    S: Stream,
    F: FnMut(S::Item) -> Option<T>,
{
    tokio::pin!(events);
    let deadline = time::sleep(scan_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = &mut deadline => return None,
            event = events.next() => match event {
                Some(event) => {
                    if let Some(found) = matcher(event) {
                        return Some(found);
                    }
                }
                None => return None,
            },
        }
    }
}
