//! ISO 7816-4 APDU 编解码
//!
//! 命令格式: `CLA INS P1 P2 [Lc Data...]`
//! 响应格式: `Data... SW1 SW2`
//!
//! 只实现本协议用到的短 APDU (Lc 单字节)，不支持扩展长度。

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const INS_SELECT: u8 = 0xA4;
pub const INS_GET_DATA: u8 = 0xCA;

/// 命令头最小长度 (CLA INS P1 P2)
pub const HEADER_LEN: usize = 4;

/// 短 APDU 的最大数据长度 (Lc 单字节)
pub const MAX_SHORT_DATA: usize = 255;

/// 2 字节状态字
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusWord(pub u16);

impl StatusWord {
    pub const SUCCESS: StatusWord = StatusWord(0x9000);
    pub const FILE_NOT_FOUND: StatusWord = StatusWord(0x6A82);
    /// P1/P2 不正确
    pub const WRONG_P1P2: StatusWord = StatusWord(0x6A86);
    pub const INS_NOT_SUPPORTED: StatusWord = StatusWord(0x6D00);
    /// 未知错误 / 命令头不匹配
    pub const UNKNOWN: StatusWord = StatusWord(0x6F00);

    pub fn from_bytes(sw1: u8, sw2: u8) -> Self {
        StatusWord(u16::from_be_bytes([sw1, sw2]))
    }

    pub fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    pub fn is_success(self) -> bool {
        self == StatusWord::SUCCESS
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

/// 解析后的命令 APDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduCommand {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub lc: Option<u8>,
    pub data: Vec<u8>,
}

/// 按指令字节分类后的命令
///
/// 每个变体携带完整的解析字段，头部是否合法由处理方判断。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Select(ApduCommand),
    GetData(ApduCommand),
    Unknown(ApduCommand),
}

impl ApduCommand {
    /// 数据超过 255 字节时返回 `InvalidConfig`
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8, data: Vec<u8>) -> Result<Self> {
        let lc = if data.is_empty() {
            None
        } else {
            let lc = u8::try_from(data.len()).map_err(|_| {
                Error::InvalidConfig(format!(
                    "APDU data is {} bytes, short APDU allows at most {}",
                    data.len(),
                    MAX_SHORT_DATA
                ))
            })?;
            Some(lc)
        };
        Ok(Self {
            cla,
            ins,
            p1,
            p2,
            lc,
            data,
        })
    }

    /// `00 A4 04 00 Lc AID` - 按 AID 选择应用
    pub fn select(aid: &[u8]) -> Result<Self> {
        Self::new(0x00, INS_SELECT, 0x04, 0x00, aid.to_vec())
    }

    /// `00 CA 00 00 [Lc data]`
    pub fn get_data(selector: Option<&[u8]>) -> Result<Self> {
        Self::new(
            0x00,
            INS_GET_DATA,
            0x00,
            0x00,
            selector.map(<[u8]>::to_vec).unwrap_or_default(),
        )
    }

    /// 解析原始字节，不足 4 字节头时返回 `None`
    ///
    /// Lc 声明的长度和实际数据不符时按实际收到的数据截取，不拒绝命令。
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < HEADER_LEN {
            return None;
        }
        let body = &raw[HEADER_LEN..];
        let (lc, data) = match body.split_first() {
            Some((&lc, rest)) => {
                let len = usize::from(lc).min(rest.len());
                (Some(lc), rest[..len].to_vec())
            }
            None => (None, Vec::new()),
        };
        Some(Self {
            cla: raw[0],
            ins: raw[1],
            p1: raw[2],
            p2: raw[3],
            lc,
            data,
        })
    }

    pub fn classify(self) -> Command {
        match self.ins {
            INS_SELECT => Command::Select(self),
            INS_GET_DATA => Command::GetData(self),
            _ => Command::Unknown(self),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + 1 + self.data.len());
        out.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2]);
        if let Some(lc) = self.lc {
            out.push(lc);
            out.extend_from_slice(&self.data);
        }
        out
    }
}

/// 响应 APDU：数据 + 状态字
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    pub data: Vec<u8>,
    pub status: StatusWord,
}

impl ApduResponse {
    pub fn status(status: StatusWord) -> Self {
        Self {
            data: Vec::new(),
            status,
        }
    }

    pub fn success(data: Vec<u8>) -> Self {
        Self {
            data,
            status: StatusWord::SUCCESS,
        }
    }

    /// 最后两个字节是状态字，不足 2 字节时返回 `None`
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let split = raw.len().checked_sub(2)?;
        let (data, sw) = raw.split_at(split);
        Some(Self {
            data: data.to_vec(),
            status: StatusWord::from_bytes(sw[0], sw[1]),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.data.clone();
        out.extend_from_slice(&self.status.to_bytes());
        out
    }
}

/// 解码十六进制字符串，忽略连字符和空白
pub fn decode_hex(s: &str) -> std::result::Result<Vec<u8>, hex::FromHexError> {
    let cleaned: String = s
        .chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .collect();
    hex::decode(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_select() {
        let raw = decode_hex("00A4040007F00000000A0101").unwrap();
        let cmd = ApduCommand::parse(&raw).unwrap();
        assert_eq!(cmd.lc, Some(7));
        assert_eq!(cmd.data, decode_hex("F00000000A0101").unwrap());
        assert!(matches!(cmd.classify(), Command::Select(_)));
    }

    #[test]
    fn test_parse_header_only() {
        let cmd = ApduCommand::parse(&[0x00, 0xCA, 0x00, 0x00]).unwrap();
        assert_eq!(cmd.lc, None);
        assert!(cmd.data.is_empty());
        assert!(matches!(cmd.classify(), Command::GetData(_)));
    }

    #[test]
    fn test_parse_truncated_data_is_lenient() {
        // Lc 声明 5 字节，实际只有 2 字节
        let cmd = ApduCommand::parse(&[0x00, 0xA4, 0x04, 0x00, 0x05, 0xAA, 0xBB]).unwrap();
        assert_eq!(cmd.lc, Some(5));
        assert_eq!(cmd.data, vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_parse_too_short() {
        assert!(ApduCommand::parse(&[0x00, 0xA4, 0x04]).is_none());
        assert!(ApduCommand::parse(&[]).is_none());
    }

    #[test]
    fn test_build_select() {
        let aid = decode_hex("F00000000A0101").unwrap();
        assert_eq!(
            hex::encode_upper(ApduCommand::select(&aid).unwrap().to_bytes()),
            "00A4040007F00000000A0101"
        );
        assert_eq!(
            hex::encode_upper(ApduCommand::get_data(None).unwrap().to_bytes()),
            "00CA0000"
        );
        assert_eq!(
            hex::encode_upper(ApduCommand::get_data(Some(&[0xAB, 0xCD])).unwrap().to_bytes()),
            "00CA000002ABCD"
        );
    }

    #[test]
    fn test_build_rejects_oversized_data() {
        let cmd = ApduCommand::get_data(Some(&[0xAB; MAX_SHORT_DATA])).unwrap();
        assert_eq!(cmd.lc, Some(0xFF));
        assert_eq!(cmd.to_bytes().len(), HEADER_LEN + 1 + MAX_SHORT_DATA);

        assert!(matches!(
            ApduCommand::get_data(Some(&[0xAB; 300])),
            Err(Error::InvalidConfig(_))
        ));
        assert!(ApduCommand::select(&[0x01; 256]).is_err());
    }

    #[test]
    fn test_response_parse() {
        let resp = ApduResponse::parse(&[0x01, 0x02, 0x90, 0x00]).unwrap();
        assert_eq!(resp.data, vec![0x01, 0x02]);
        assert!(resp.status.is_success());

        let bare = ApduResponse::parse(&[0x6A, 0x86]).unwrap();
        assert!(bare.data.is_empty());
        assert_eq!(bare.status, StatusWord::WRONG_P1P2);

        assert!(ApduResponse::parse(&[0x90]).is_none());
    }

    #[test]
    fn test_status_word_display() {
        assert_eq!(StatusWord::INS_NOT_SUPPORTED.to_string(), "6D00");
        assert_eq!(StatusWord::SUCCESS.to_bytes(), [0x90, 0x00]);
    }

    #[test]
    fn test_decode_hex_strips_hyphens() {
        let bytes = decode_hex("12345678-1234-5678-1234-567812345678").unwrap();
        assert_eq!(bytes.len(), 16);
        assert!(decode_hex("ABC").is_err());
    }
}
