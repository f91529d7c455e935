//! Duolink Core Library
//!
//! 通过 BLE 和 NFC 两条通道交换设备标识符
//!
//! # 模块
//!
//! - **ble**: BLE 外设（广播、GATT Server、连接跟踪、接收队列）和中心端
//! - **nfc**: 卡模拟 APDU 分发和读卡端 SELECT / GET DATA 交换
//! - **config**: 卡模拟配置、键值存储和应用设置
//! - **events**: 交给应用层的结构化事件
//! - **exchange**: 组合以上模块的高层 API
//!
//! # 使用示例
//!
//! ## BLE 外设
//!
//! ```ignore
//! use duolink_core::{AppSettings, BluezBackend, IdentifierExchange, StaticPermissions};
//!
//! let (events, mut rx) = duolink_core::events::channel();
//! let exchange = IdentifierExchange::new(
//!     Arc::new(BluezBackend::new()),
//!     Arc::new(StaticPermissions::granted()),
//!     Arc::new(TomlConfigStore::open(TomlConfigStore::default_path())?),
//!     AppSettings::load(),
//!     events,
//! )?;
//!
//! // 广播并注册交换服务
//! exchange.setup_peripheral().await?;
//!
//! // 收到写入后取出消息，回复最早连接的对端
//! while let Some(event) = rx.recv().await {
//!     if let ExchangeEvent::Received { .. } = event {
//!         let message = exchange.poll_received();
//!         exchange.send("ack").await?;
//!     }
//! }
//! ```
//!
//! ## 读卡
//!
//! ```ignore
//! exchange.configure_hce("F00000000A0101", "12345678-1234-5678-1234-567812345678")?;
//!
//! let tag = DiscoveredTag::IsoDep(Box::new(LoopbackTag::new(exchange.hce())));
//! let uuid = exchange.send_over_nfc_reader(tag, "").await?;
//! ```

pub mod ble;
pub mod config;
pub mod error;
pub mod events;
pub mod exchange;
pub mod nfc;
pub mod permissions;

pub use error::{AdvertiseErrorCode, Error, ExchangeStep, Result};

// BLE re-exports
pub use ble::{
    AdapterStatus, AdvertiseOutcome, BleCentral, BleCentralError, BlePeripheralManager,
    BluezBackend, ConnectionRecord, ConnectionState, DEFAULT_SERVICE_UUID,
    GattServiceDescriptor, PeripheralBackend, SimulatedBackend,
};

// Config re-exports
pub use config::{AppSettings, ConfigStore, HceConfig, MemoryConfigStore, TomlConfigStore};

pub use events::{EventChannel, EventSink, ExchangeEvent};
pub use exchange::IdentifierExchange;

// NFC re-exports
pub use nfc::{
    ApduHandler, DiscoveredTag, HceDispatcher, LoopbackTag, NfcReader, ReaderProvider,
    ReaderState, StatusWord, TagTechnology,
};

pub use permissions::{Permission, PermissionGate, StaticPermissions};
