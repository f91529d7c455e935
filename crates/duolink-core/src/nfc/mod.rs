//! NFC：卡模拟端和读卡端
//!
//! - [`HceDispatcher`]: 回答 SELECT / GET DATA 的卡应用
//! - [`NfcReader`]: 对发现的标签执行 SELECT -> GET DATA，解码对端标识符
//! - [`LoopbackTag`]: 进程内的读卡 <-> 卡模拟回环
//! - `PcscReader` (feature `pcsc`): PC/SC 非接触读卡器

pub mod apdu;
pub mod hce;
pub mod loopback;
#[cfg(feature = "pcsc")]
pub mod pcsc;
pub mod reader;

pub use apdu::{ApduCommand, ApduResponse, Command, StatusWord};
pub use hce::{ApduHandler, DeactivationReason, HceDispatcher};
pub use loopback::LoopbackTag;
#[cfg(feature = "pcsc")]
pub use self::pcsc::{PcscReader, PcscTag};
pub use reader::{
    DiscoveredTag, NfcReader, ReaderProvider, ReaderState, TagTechnology, format_identifier,
    read_identifier,
};
