//! 接收队列
//!
//! 桥接 GATT 写回调（生产者）和应用轮询（消费者）。
//! 无界 FIFO，出队顺序等于写入到达顺序。

use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
pub struct ReceiveQueue {
    inner: Mutex<VecDeque<String>>,
}

impl ReceiveQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 处理一次特征写入
    ///
    /// 载荷按 UTF-8 解码后入队并返回解码结果；解码失败时不入队。
    /// 无论结果如何，链路层的写确认都已经由后端发出。
    pub fn on_write(&self, payload: &[u8]) -> Option<String> {
        match std::str::from_utf8(payload) {
            Ok(text) => {
                let text = text.to_string();
                self.lock().push_back(text.clone());
                debug!("Queued {} bytes from characteristic write", payload.len());
                Some(text)
            }
            Err(e) => {
                warn!("Dropping non UTF-8 write ({} bytes): {}", payload.len(), e);
                None
            }
        }
    }

    /// 取出队首消息
    ///
    /// 队列为空时返回 `None`；收到空字符串时返回 `Some("")`，两者可区分。
    pub fn poll(&self) -> Option<String> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
