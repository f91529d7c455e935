//! 读卡端交换
//!
//! 发现标签后执行 SELECT -> GET DATA，在第一个失败处中止。
//! 成功时只上报解码后的标识符，失败时只上报一个结构化错误，
//! 不会出现部分结果。任何退出路径都会关闭标签会话。

use crate::config::IDENTIFIER_LEN;
use crate::error::ExchangeStep;
use crate::events::{EventSink, ExchangeEvent};
use crate::nfc::apdu::{ApduCommand, ApduResponse};
use crate::{Error, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};

/// ISO-DEP 标签会话
#[async_trait]
pub trait TagTechnology: Send {
    async fn connect(&mut self) -> Result<()>;

    async fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>>;

    async fn close(&mut self) -> Result<()>;
}

/// 一次标签发现
pub enum DiscoveredTag {
    IsoDep(Box<dyn TagTechnology>),
    /// 不支持的技术，只记录技术名称
    Other { technologies: Vec<String> },
}

/// 读卡器可用性
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    NotSupported,
    Disabled,
    Ready,
}

/// 平台读卡器
#[async_trait]
pub trait ReaderProvider: Send + Sync {
    async fn reader_state(&self) -> ReaderState;
}

/// 读取对端标识符，返回 8-4-4-4-12 格式的字符串
///
/// `selector` 非空时附加在 GET DATA 命令后面。
pub async fn read_identifier(
    tag: &mut dyn TagTechnology,
    aid: &[u8],
    selector: Option<&[u8]>,
) -> Result<String> {
    let result = exchange_apdus(tag, aid, selector).await;
    if let Err(e) = tag.close().await {
        warn!("Failed to close tag session: {}", e);
    }
    result
}

async fn exchange_apdus(
    tag: &mut dyn TagTechnology,
    aid: &[u8],
    selector: Option<&[u8]>,
) -> Result<String> {
    let select = ApduCommand::select(aid)?;
    let get_data = ApduCommand::get_data(selector)?;

    tag.connect().await?;
    transmit(tag, ExchangeStep::Select, &select).await?;
    let response = transmit(tag, ExchangeStep::GetData, &get_data).await?;
    format_identifier(&response.data)
}

async fn transmit(
    tag: &mut dyn TagTechnology,
    step: ExchangeStep,
    command: &ApduCommand,
) -> Result<ApduResponse> {
    let raw = command.to_bytes();
    debug!("{} -> {}", step, hex::encode_upper(&raw));

    let reply = tag.transceive(&raw).await?;
    debug!("{} <- {}", step, hex::encode_upper(&reply));

    let response = ApduResponse::parse(&reply)
        .ok_or_else(|| Error::Io(format!("{} response too short ({} bytes)", step, reply.len())))?;
    if !response.status.is_success() {
        return Err(Error::Protocol {
            step,
            status: response.status,
        });
    }
    Ok(response)
}

/// 16 字节 -> `XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX`（大写）
pub fn format_identifier(data: &[u8]) -> Result<String> {
    if data.len() != IDENTIFIER_LEN {
        return Err(Error::InvalidIdentifier(format!(
            "expected {} bytes, got {}",
            IDENTIFIER_LEN,
            data.len()
        )));
    }
    let hex = hex::encode_upper(data);
    Ok(format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    ))
}

/// 读卡端：每次标签发现产生一个独立的交换
pub struct NfcReader {
    events: EventSink,
}

impl NfcReader {
    pub fn new(events: EventSink) -> Self {
        Self { events }
    }

    /// 检查读卡器，不可用时在事件通道上报告错误
    pub async fn check_status(&self, provider: &dyn ReaderProvider) -> Result<()> {
        let result = match provider.reader_state().await {
            ReaderState::NotSupported => Err(Error::NfcUnavailable),
            ReaderState::Disabled => Err(Error::NfcDisabled),
            ReaderState::Ready => Ok(()),
        };
        if let Err(e) = &result {
            warn!("NFC reader unavailable: {}", e);
            self.events.send(ExchangeEvent::from_error(e));
        }
        result
    }

    /// 处理一次标签发现
    ///
    /// 成功和失败都恰好产生一个事件，不自动重试。
    pub async fn exchange(
        &self,
        tag: DiscoveredTag,
        aid: &[u8],
        selector: Option<&[u8]>,
    ) -> Result<String> {
        let result = match tag {
            DiscoveredTag::IsoDep(mut tech) => read_identifier(tech.as_mut(), aid, selector).await,
            DiscoveredTag::Other { technologies } => {
                warn!("Unsupported tag technologies: {:?}", technologies);
                Err(Error::UnsupportedTag)
            }
        };

        match &result {
            Ok(uuid) => {
                info!("Read identifier {}", uuid);
                self.events
                    .send(ExchangeEvent::Identifier { uuid: uuid.clone() });
            }
            Err(e) => {
                error!("NFC exchange failed: {}", e);
                self.events.send(ExchangeEvent::from_error(e));
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::nfc::apdu::StatusWord;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// 按顺序回放预设响应，并记录发出的命令
    #[derive(Clone, Default)]
    struct ScriptedTag {
        replies: Arc<Mutex<VecDeque<Result<Vec<u8>>>>>,
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        closed: Arc<Mutex<bool>>,
        refuse_connect: bool,
    }

    impl ScriptedTag {
        fn new(replies: Vec<Result<Vec<u8>>>) -> Self {
            Self {
                replies: Arc::new(Mutex::new(replies.into())),
                ..Default::default()
            }
        }

        fn refusing_connect() -> Self {
            Self {
                refuse_connect: true,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl TagTechnology for ScriptedTag {
        async fn connect(&mut self) -> Result<()> {
            if self.refuse_connect {
                return Err(Error::Io("tag moved out of range".to_string()));
            }
            Ok(())
        }

        async fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>> {
            self.sent.lock().unwrap().push(command.to_vec());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::Io("tag lost".to_string())))
        }

        async fn close(&mut self) -> Result<()> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }
    }

    const AID: [u8; 7] = [0xF0, 0x00, 0x00, 0x00, 0x0A, 0x01, 0x01];

    fn identifier_reply() -> Vec<u8> {
        let mut reply = hex::decode("0123456789ABCDEF0123456789ABCDEF").unwrap();
        reply.extend_from_slice(&[0x90, 0x00]);
        reply
    }

    #[test]
    fn test_format_identifier() {
        let data = hex::decode("12345678123456781234567812345678").unwrap();
        assert_eq!(
            format_identifier(&data).unwrap(),
            "12345678-1234-5678-1234-567812345678"
        );
        assert!(matches!(
            format_identifier(&data[..15]),
            Err(Error::InvalidIdentifier(_))
        ));
    }

    #[tokio::test]
    async fn test_read_identifier_sends_select_then_get_data() {
        let mut tag = ScriptedTag::new(vec![Ok(vec![0x90, 0x00]), Ok(identifier_reply())]);
        let id = read_identifier(&mut tag, &AID, None).await.unwrap();

        assert_eq!(id, "01234567-89AB-CDEF-0123-456789ABCDEF");
        let sent = tag.sent.lock().unwrap().clone();
        assert_eq!(hex::encode_upper(&sent[0]), "00A4040007F00000000A0101");
        assert_eq!(hex::encode_upper(&sent[1]), "00CA0000");
        assert!(*tag.closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_select_failure_aborts() {
        let mut tag = ScriptedTag::new(vec![Ok(vec![0x6A, 0x82])]);
        let err = read_identifier(&mut tag, &AID, None).await.unwrap_err();

        assert!(matches!(
            err,
            Error::Protocol {
                step: ExchangeStep::Select,
                status: StatusWord::FILE_NOT_FOUND
            }
        ));
        assert_eq!(tag.sent.lock().unwrap().len(), 1);
        assert!(*tag.closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_io_failure_closes_tag() {
        let mut tag = ScriptedTag::new(vec![
            Ok(vec![0x90, 0x00]),
            Err(Error::Io("transceive failed".to_string())),
        ]);
        let err = read_identifier(&mut tag, &AID, Some(&[0x01])).await.unwrap_err();
        assert_eq!(err.code(), "IO_ERROR");
        assert!(*tag.closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_connect_failure_closes_tag() {
        let mut tag = ScriptedTag::refusing_connect();
        let err = read_identifier(&mut tag, &AID, None).await.unwrap_err();

        assert_eq!(err.code(), "IO_ERROR");
        assert!(tag.sent.lock().unwrap().is_empty());
        assert!(*tag.closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_selector_appended_to_get_data() {
        let mut tag = ScriptedTag::new(vec![Ok(vec![0x90, 0x00]), Ok(identifier_reply())]);
        read_identifier(&mut tag, &AID, Some(&[0x01, 0x02, 0x03]))
            .await
            .unwrap();

        let sent = tag.sent.lock().unwrap().clone();
        assert_eq!(hex::encode_upper(&sent[1]), "00CA000003010203");
    }

    #[tokio::test]
    async fn test_oversized_selector_sends_nothing() {
        let mut tag = ScriptedTag::new(vec![Ok(vec![0x90, 0x00]), Ok(identifier_reply())]);
        let err = read_identifier(&mut tag, &AID, Some(&[0xAB; 300]))
            .await
            .unwrap_err();

        assert_eq!(err.code(), "INVALID_CONFIG");
        assert!(tag.sent.lock().unwrap().is_empty());
        assert!(*tag.closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_exchange_emits_exactly_one_event() {
        let (sink, mut rx) = events::channel();
        let reader = NfcReader::new(sink);

        let tag = ScriptedTag::new(vec![Ok(vec![0x90, 0x00]), Ok(vec![0x6A, 0x86])]);
        let result = reader
            .exchange(DiscoveredTag::IsoDep(Box::new(tag)), &AID, None)
            .await;
        assert!(result.is_err());

        let event = rx.try_recv().unwrap();
        assert_eq!(
            event,
            ExchangeEvent::Error {
                code: "PROTOCOL_ERROR".to_string(),
                message: "GET DATA answered 6A86, expected 9000".to_string(),
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsupported_tag() {
        let (sink, mut rx) = events::channel();
        let reader = NfcReader::new(sink);

        let result = reader
            .exchange(
                DiscoveredTag::Other {
                    technologies: vec!["MifareClassic".to_string()],
                },
                &AID,
                None,
            )
            .await;
        assert!(matches!(result, Err(Error::UnsupportedTag)));
        assert!(matches!(
            rx.try_recv().unwrap(),
            ExchangeEvent::Error { code, .. } if code == "TAG_ERROR"
        ));
    }

    struct FixedProvider(ReaderState);

    #[async_trait]
    impl ReaderProvider for FixedProvider {
        async fn reader_state(&self) -> ReaderState {
            self.0
        }
    }

    #[tokio::test]
    async fn test_check_status_reports_codes() {
        let (sink, mut rx) = events::channel();
        let reader = NfcReader::new(sink);

        assert!(reader.check_status(&FixedProvider(ReaderState::Ready)).await.is_ok());
        assert!(rx.try_recv().is_err());

        assert!(matches!(
            reader
                .check_status(&FixedProvider(ReaderState::NotSupported))
                .await,
            Err(Error::NfcUnavailable)
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            ExchangeEvent::Error { code, .. } if code == "NFC_NOT_SUPPORTED"
        ));

        assert!(reader.check_status(&FixedProvider(ReaderState::Disabled)).await.is_err());
        assert!(matches!(
            rx.try_recv().unwrap(),
            ExchangeEvent::Error { code, .. } if code == "NFC_DISABLED"
        ));
    }
}
