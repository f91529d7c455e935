//! BLE 外设角色与中心端对端
//!
//! - [`BlePeripheralManager`]: 广播、GATT Server、连接跟踪、接收队列、通知
//! - [`PeripheralBackend`]: 硬件后端，[`BluezBackend`] 与 [`SimulatedBackend`]
//! - [`BleCentral`]: 连接另一台机器上的外设并收发消息

pub mod adv;
pub mod backend;
pub mod bluez;
pub mod central;
pub mod connection;
pub mod gatt;
pub mod peripheral;
pub mod queue;
pub mod simulated;

use uuid::Uuid;

/// Client Characteristic Configuration 描述符
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// 默认交换服务 UUID，特征使用同一个 UUID
pub const DEFAULT_SERVICE_UUID: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_567812345002);

pub use adv::{AdvertiseMode, AdvertiseSettings, PeripheralAdvertisement, TxPowerLevel};
pub use backend::{AdapterStatus, HardwareEvent, PeripheralBackend};
pub use bluez::BluezBackend;
pub use central::{BleCentral, BleCentralError};
pub use connection::{ConnectionRecord, ConnectionState, ConnectionTracker};
pub use gatt::{
    AttributePermissions, CharacteristicDescriptor, CharacteristicProperties, DescriptorInfo,
    GattServiceDescriptor, ServiceType,
};
pub use peripheral::{AdvertiseOutcome, BlePeripheralManager};
pub use queue::ReceiveQueue;
pub use simulated::{SentNotification, SimulatedBackend};
