//! PC/SC 非接触读卡器 (ACR122 一类)
//!
//! pcsc 的调用都是阻塞的；等待标签放到 `spawn_blocking` 里，
//! 单条 APDU 很短，直接在当前任务里收发。

use crate::nfc::reader::{DiscoveredTag, ReaderProvider, ReaderState, TagTechnology};
use crate::{Error, Result};
use ::pcsc::{
    Card, Context, Disposition, MAX_BUFFER_SIZE, Protocols, ReaderState as PcscReaderState, Scope,
    ShareMode, State,
};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::ffi::CString;
use std::time::Duration;

fn io_error(e: ::pcsc::Error) -> Error {
    Error::Io(e.to_string())
}

pub struct PcscReader {
    context: Context,
}

impl PcscReader {
    pub fn new() -> Result<Self> {
        let context = Context::establish(Scope::User).map_err(|e| {
            warn!("PC/SC service unavailable: {}", e);
            Error::NfcUnavailable
        })?;
        Ok(Self { context })
    }

    fn first_reader(&self) -> Result<CString> {
        let readers = self.context.list_readers_owned().map_err(|e| match e {
            ::pcsc::Error::NoReadersAvailable => Error::NfcUnavailable,
            other => io_error(other),
        })?;
        readers.into_iter().next().ok_or(Error::NfcUnavailable)
    }

    /// 等待卡片进入读卡器场区，超时返回 `Ok(None)`
    pub async fn wait_for_tag(&self, timeout: Duration) -> Result<Option<DiscoveredTag>> {
        let reader = self.first_reader()?;
        info!("Waiting for tag on {:?}", reader);

        let context = self.context.clone();
        let name = reader.clone();
        let present = tokio::task::spawn_blocking(move || -> Result<bool> {
            let mut states = [PcscReaderState::new(name, State::UNAWARE)];
            context
                .get_status_change(Duration::ZERO, &mut states)
                .map_err(io_error)?;
            if states[0].event_state().contains(State::PRESENT) {
                return Ok(true);
            }
            states[0].sync_current_state();
            match context.get_status_change(timeout, &mut states) {
                Ok(()) => Ok(states[0].event_state().contains(State::PRESENT)),
                Err(::pcsc::Error::Timeout) => Ok(false),
                Err(e) => Err(io_error(e)),
            }
        })
        .await
        .map_err(|e| Error::Io(e.to_string()))??;

        if !present {
            return Ok(None);
        }
        debug!("Card present on {:?}", reader);
        Ok(Some(DiscoveredTag::IsoDep(Box::new(PcscTag {
            context: self.context.clone(),
            reader,
            card: None,
        }))))
    }
}

#[async_trait]
impl ReaderProvider for PcscReader {
    async fn reader_state(&self) -> ReaderState {
        match self.first_reader() {
            Ok(_) => ReaderState::Ready,
            Err(Error::NfcUnavailable) => ReaderState::NotSupported,
            Err(_) => ReaderState::Disabled,
        }
    }
}

pub struct PcscTag {
    context: Context,
    reader: CString,
    card: Option<Card>,
}

#[async_trait]
impl TagTechnology for PcscTag {
    async fn connect(&mut self) -> Result<()> {
        let card = self
            .context
            .connect(&self.reader, ShareMode::Shared, Protocols::ANY)
            .map_err(io_error)?;
        self.card = Some(card);
        Ok(())
    }

    async fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        let card = self
            .card
            .as_ref()
            .ok_or_else(|| Error::Io("card not connected".to_string()))?;
        let mut buf = [0u8; MAX_BUFFER_SIZE];
        let reply = card.transmit(command, &mut buf).map_err(io_error)?;
        Ok(reply.to_vec())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(card) = self.card.take() {
            card.disconnect(Disposition::LeaveCard)
                .map_err(|(_, e)| io_error(e))?;
        }
        Ok(())
    }
}
