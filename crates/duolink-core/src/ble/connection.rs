//! 连接状态跟踪
//!
//! 维护当前连接到外设的中心端集合。按地址去重，保持首次连接的顺序：
//! 通知总是发往集合中的第一个对端。

use crate::events::ExchangeEvent;
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

/// 协议栈报告的连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub address: String,
    pub name: Option<String>,
    pub state: ConnectionState,
}

#[derive(Debug, Default)]
pub struct ConnectionTracker {
    peers: Mutex<Vec<ConnectionRecord>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 应用一次连接状态回调，返回需要上报的事件
    ///
    /// `Connected` 插入或原位替换该地址的记录；其他任何状态都移除该地址的所有记录。
    pub fn apply(
        &self,
        address: &str,
        name: Option<String>,
        state: ConnectionState,
    ) -> ExchangeEvent {
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);

        if state == ConnectionState::Connected {
            let record = ConnectionRecord {
                address: address.to_string(),
                name: name.clone(),
                state,
            };
            match peers.iter_mut().find(|p| p.address == address) {
                Some(existing) => *existing = record,
                None => peers.push(record),
            }
            info!(
                "Peer connected: address={}, name={:?}, tracked={}",
                address,
                name,
                peers.len()
            );
            ExchangeEvent::Connected {
                address: address.to_string(),
                name,
            }
        } else {
            peers.retain(|p| p.address != address);
            info!(
                "Peer {} -> {:?}, tracked={}",
                address,
                state,
                peers.len()
            );
            ExchangeEvent::Disconnected {
                address: address.to_string(),
            }
        }
    }

    /// 通知目标：最早被跟踪的对端
    pub fn first(&self) -> Option<ConnectionRecord> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .first()
            .cloned()
    }

    pub fn peers(&self) -> Vec<ConnectionRecord> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|p| p.address == address)
    }

    pub fn clear(&self) {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "AA:AA:AA:AA:AA:AA";
    const B: &str = "BB:BB:BB:BB:BB:BB";

    #[test]
    fn test_connect_connect_disconnect() {
        let tracker = ConnectionTracker::new();
        tracker.apply(A, None, ConnectionState::Connected);
        tracker.apply(B, None, ConnectionState::Connected);
        tracker.apply(A, None, ConnectionState::Disconnected);

        let peers = tracker.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].address, B);
    }

    #[test]
    fn test_repeated_connect_does_not_duplicate() {
        let tracker = ConnectionTracker::new();
        tracker.apply(A, None, ConnectionState::Connected);
        tracker.apply(B, None, ConnectionState::Connected);
        tracker.apply(A, Some("phone".to_string()), ConnectionState::Connected);

        let peers = tracker.peers();
        assert_eq!(peers.len(), 2);
        // 原位替换，A 仍是通知目标
        assert_eq!(tracker.first().unwrap().address, A);
        assert_eq!(peers[0].name.as_deref(), Some("phone"));
    }

    #[test]
    fn test_any_other_state_removes() {
        let tracker = ConnectionTracker::new();
        tracker.apply(A, None, ConnectionState::Connected);
        let event = tracker.apply(A, None, ConnectionState::Disconnecting);
        assert!(tracker.peers().is_empty());
        assert_eq!(
            event,
            ExchangeEvent::Disconnected {
                address: A.to_string()
            }
        );
    }

    #[test]
    fn test_events_mirror_callbacks() {
        let tracker = ConnectionTracker::new();
        let event = tracker.apply(A, Some("peer".to_string()), ConnectionState::Connected);
        assert_eq!(
            event,
            ExchangeEvent::Connected {
                address: A.to_string(),
                name: Some("peer".to_string()),
            }
        );
        assert!(tracker.is_connected(A));
        assert!(!tracker.is_connected(B));
    }
}
