//! 应用事件通道
//!
//! 硬件回调线程产生的所有结果（连接变化、收到的数据、读到的标识符、错误）
//! 都以结构化事件的形式通过同一个 `send` 原语交给应用层。

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// 交给应用层的结构化事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExchangeEvent {
    Connected {
        address: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Disconnected {
        address: String,
    },
    /// 外设收到中心端写入的文本
    Received { message: String },
    /// 读卡端解码出的对端标识符 (8-4-4-4-12)
    Identifier { uuid: String },
    AdvertisingStarted,
    AdvertisingFailed { code: i32 },
    ServiceAdded { uuid: Uuid, success: bool },
    Error { code: String, message: String },
}

impl ExchangeEvent {
    pub fn from_error(err: &crate::Error) -> Self {
        ExchangeEvent::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    /// 平台通道上传递的 JSON，例如 `{"type":"Connected","address":"..."}`
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            log::error!("Failed to serialize event: {}", e);
            String::from("{}")
        })
    }
}

/// 事件通道抽象，只有一个 `send` 原语
///
/// 实现必须不阻塞：调用方往往是硬件回调。
pub trait EventChannel: Send + Sync {
    fn send(&self, event: ExchangeEvent);
}

pub type EventSink = Arc<dyn EventChannel>;

impl EventChannel for mpsc::UnboundedSender<ExchangeEvent> {
    fn send(&self, event: ExchangeEvent) {
        if mpsc::UnboundedSender::send(self, event).is_err() {
            log::trace!("Event receiver dropped, event discarded");
        }
    }
}

impl EventChannel for mpsc::Sender<ExchangeEvent> {
    fn send(&self, event: ExchangeEvent) {
        if let Err(e) = self.try_send(event) {
            log::warn!("Event channel unavailable, event discarded: {}", e);
        }
    }
}

/// 创建一个无界事件通道
pub fn channel() -> (EventSink, mpsc::UnboundedReceiver<ExchangeEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(tx), rx)
}
