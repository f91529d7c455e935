//! 卡模拟 (HCE) 命令分发
//!
//! 最小的 ISO 7816-4 卡应用：
//!
//! | 命令 | 条件 | 响应 |
//! |------|------|------|
//! | SELECT (A4) | CLA=00, P1=04, P2=00 | `9000`，AID 内容不比较 |
//! | SELECT (A4) | 其他头部 | `6F00` |
//! | GET DATA (CA) | P1=00, P2=00 | 标识符 16 字节 + `9000` |
//! | GET DATA (CA) | 其他 | `6A86` |
//! | 其他指令 | | `6D00` |
//!
//! 配置是一个不可变快照，可以在两次命令之间整体替换，分发器不需要重启。

use crate::config::{ConfigStore, HceConfig, KEY_LAST_READ};
use crate::nfc::apdu::{ApduCommand, ApduResponse, Command, INS_GET_DATA, StatusWord};
use log::{debug, info, trace, warn};
use rand::RngCore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// 诊断记录的长度（命令回显 + 随机填充）
const LAST_READ_RECORD_LEN: usize = 32;

/// 卡应用接口：输入命令 APDU，输出响应 APDU
///
/// 实现必须总是返回一个响应，不能因为畸形命令而失效。
pub trait ApduHandler: Send + Sync {
    fn handle_command(&self, apdu: &[u8]) -> Vec<u8>;

    /// 读卡器离开或选择了其他应用
    fn on_deactivated(&self, reason: DeactivationReason) {
        debug!("Card emulation deactivated: {:?}", reason);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeactivationReason {
    LinkLoss,
    Deselected,
}

pub struct HceDispatcher {
    config: RwLock<Arc<HceConfig>>,
    enabled: AtomicBool,
    recorder: Option<Arc<dyn ConfigStore>>,
}

impl HceDispatcher {
    pub fn new(config: HceConfig) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
            enabled: AtomicBool::new(true),
            recorder: None,
        }
    }

    /// GET DATA 成功时把诊断记录写入 `store` 的 `last_read` 键
    pub fn with_last_read_recorder(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.recorder = Some(store);
        self
    }

    /// 替换配置快照，下一条命令开始生效
    pub fn configure(&self, config: HceConfig) {
        info!(
            "HCE config updated: aid={}, identifier={}",
            config.aid(),
            config.identifier()
        );
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
    }

    pub fn config(&self) -> Arc<HceConfig> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 关闭后所有命令都回答 `6F00`
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        info!("HCE {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn process(&self, raw: &[u8]) -> ApduResponse {
        trace!("APDU <- {}", hex::encode_upper(raw));

        if !self.is_enabled() {
            return ApduResponse::status(StatusWord::UNKNOWN);
        }

        let Some(command) = ApduCommand::parse(raw) else {
            // 头部不完整
            let status = if raw.get(1) == Some(&INS_GET_DATA) {
                StatusWord::WRONG_P1P2
            } else {
                StatusWord::UNKNOWN
            };
            warn!("Truncated APDU ({} bytes), answering {}", raw.len(), status);
            return ApduResponse::status(status);
        };

        let response = match command.classify() {
            Command::Select(cmd) => {
                if cmd.cla == 0x00 && cmd.p1 == 0x04 && cmd.p2 == 0x00 {
                    debug!("SELECT aid={}", hex::encode_upper(&cmd.data));
                    ApduResponse::status(StatusWord::SUCCESS)
                } else {
                    ApduResponse::status(StatusWord::UNKNOWN)
                }
            }
            Command::GetData(cmd) => {
                if cmd.p1 == 0x00 && cmd.p2 == 0x00 {
                    let config = self.config();
                    self.record_last_read(raw);
                    ApduResponse::success(config.identifier_bytes())
                } else {
                    ApduResponse::status(StatusWord::WRONG_P1P2)
                }
            }
            Command::Unknown(cmd) => {
                debug!("Unsupported instruction {:02X}", cmd.ins);
                ApduResponse::status(StatusWord::INS_NOT_SUPPORTED)
            }
        };

        debug!("APDU -> status {}", response.status);
        response
    }

    /// 命令回显 + 随机填充，失败只记日志
    fn record_last_read(&self, command: &[u8]) {
        let Some(store) = &self.recorder else {
            return;
        };

        let mut record = command.to_vec();
        if record.len() < LAST_READ_RECORD_LEN {
            let mut padding = vec![0u8; LAST_READ_RECORD_LEN - record.len()];
            rand::thread_rng().fill_bytes(&mut padding);
            record.extend_from_slice(&padding);
        }

        if let Err(e) = store.set(KEY_LAST_READ, &hex::encode_upper(&record)) {
            warn!("Failed to store last read record: {}", e);
        }
    }
}

impl ApduHandler for HceDispatcher {
    fn handle_command(&self, apdu: &[u8]) -> Vec<u8> {
        self.process(apdu).to_bytes()
    }
}
