//! 回环标签
//!
//! 把读卡端的 transceive 直接交给本进程内的卡应用，用于没有 NFC 硬件时
//! 演示和测试完整的读卡 <-> 卡模拟交换。

use crate::nfc::hce::{ApduHandler, DeactivationReason};
use crate::nfc::reader::TagTechnology;
use crate::{Error, Result};
use async_trait::async_trait;
use log::trace;
use std::sync::Arc;

pub struct LoopbackTag {
    card: Arc<dyn ApduHandler>,
    connected: bool,
}

impl LoopbackTag {
    pub fn new(card: Arc<dyn ApduHandler>) -> Self {
        Self {
            card,
            connected: false,
        }
    }
}

#[async_trait]
impl TagTechnology for LoopbackTag {
    async fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    async fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        if !self.connected {
            return Err(Error::Io("tag session is not open".to_string()));
        }
        let reply = self.card.handle_command(command);
        trace!(
            "Loopback {} byte command, {} byte reply",
            command.len(),
            reply.len()
        );
        Ok(reply)
    }

    async fn close(&mut self) -> Result<()> {
        if self.connected {
            self.connected = false;
            self.card.on_deactivated(DeactivationReason::Deselected);
        }
        Ok(())
    }
}
