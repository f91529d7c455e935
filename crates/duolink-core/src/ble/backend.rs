//! BLE 外设后端抽象
//!
//! 后端负责真正的硬件调用：适配器、广播、GATT Server、通知。
//! 硬件回调不直接操作共享状态，而是把 [`HardwareEvent`] 推入通道，
//! 由 [`BlePeripheralManager`](super::BlePeripheralManager) 的单一消费循环处理。
//!
//! 每个读/写请求都必须在回调内立即成功确认，内容校验在上层进行。

use crate::Result;
use crate::ble::adv::PeripheralAdvertisement;
use crate::ble::connection::ConnectionState;
use crate::ble::gatt::GattServiceDescriptor;
use crate::error::AdvertiseErrorCode;
use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterStatus {
    Enabled,
    Disabled,
}

/// 硬件回调消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardwareEvent {
    ConnectionStateChanged {
        address: String,
        name: Option<String>,
        state: ConnectionState,
    },
    CharacteristicRead {
        address: String,
        characteristic: Uuid,
        offset: u16,
    },
    CharacteristicWrite {
        address: String,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    DescriptorWrite {
        descriptor: Uuid,
        value: Vec<u8>,
    },
    NotificationsEnabled {
        characteristic: Uuid,
    },
    NotificationsDisabled {
        characteristic: Uuid,
    },
}

pub type HardwareEventSender = mpsc::UnboundedSender<HardwareEvent>;

#[async_trait]
pub trait PeripheralBackend: Send + Sync {
    /// 解析适配器；不存在时返回 `Error::AdapterUnavailable`
    async fn adapter_status(&self) -> Result<AdapterStatus>;

    /// 请求打开适配器，不等待结果
    ///
    /// 是否成功通过之后的 [`adapter_status`](Self::adapter_status) 观察。
    async fn request_enable(&self);

    async fn start_advertising(
        &self,
        advertisement: &PeripheralAdvertisement,
    ) -> std::result::Result<(), AdvertiseErrorCode>;

    async fn stop_advertising(&self) -> Result<()>;

    /// 打开 GATT Server 并注册服务，返回注册结果
    async fn open_gatt_server(
        &self,
        service: &GattServiceDescriptor,
        events: HardwareEventSender,
    ) -> Result<bool>;

    async fn close_gatt_server(&self);

    /// 向对端发送通知 (write type: no response)
    async fn notify(&self, peer: &str, characteristic: Uuid, payload: &[u8]) -> Result<bool>;
}
