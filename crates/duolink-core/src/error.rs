//! 错误类型
//!
//! BLE 外设与 NFC 交换层共用的错误分类。每个错误都有一个稳定的机器码
//! (`Error::code`)，用于在事件通道上以结构化形式上报。

use crate::nfc::apdu::StatusWord;
use crate::permissions::Permission;
use std::fmt;

/// 广播启动失败码
///
/// 数值与 Android `AdvertiseCallback` 的失败码保持一致，便于和手机端日志对照。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertiseErrorCode {
    DataTooLarge,
    TooManyAdvertisers,
    AlreadyStarted,
    InternalError,
    FeatureUnsupported,
}

impl AdvertiseErrorCode {
    pub fn code(self) -> i32 {
        match self {
            AdvertiseErrorCode::DataTooLarge => 1,
            AdvertiseErrorCode::TooManyAdvertisers => 2,
            AdvertiseErrorCode::AlreadyStarted => 3,
            AdvertiseErrorCode::InternalError => 4,
            AdvertiseErrorCode::FeatureUnsupported => 5,
        }
    }
}

impl fmt::Display for AdvertiseErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdvertiseErrorCode::DataTooLarge => "data too large",
            AdvertiseErrorCode::TooManyAdvertisers => "too many advertisers",
            AdvertiseErrorCode::AlreadyStarted => "already started",
            AdvertiseErrorCode::InternalError => "internal error",
            AdvertiseErrorCode::FeatureUnsupported => "feature unsupported",
        };
        write!(f, "{} (code {})", name, self.code())
    }
}

/// 读卡流程中的步骤，用于定位协议失败发生的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStep {
    Select,
    GetData,
}

impl fmt::Display for ExchangeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeStep::Select => write!(f, "SELECT"),
            ExchangeStep::GetData => write!(f, "GET DATA"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("Bluetooth adapter unavailable")]
    AdapterUnavailable,

    #[error("Bluetooth adapter is disabled")]
    AdapterDisabled,

    #[error("Missing permissions: {0:?}")]
    PermissionDenied(Vec<Permission>),

    #[error("Advertising failed: {0}")]
    AdvertiseFailure(AdvertiseErrorCode),

    #[error("GATT service registration failed: {0}")]
    ServiceRegistrationFailure(String),

    #[error("IO failure: {0}")]
    Io(String),

    #[error("{step} answered {status}, expected 9000")]
    Protocol {
        step: ExchangeStep,
        status: StatusWord,
    },

    #[error("Unsupported tag type")]
    UnsupportedTag,

    #[error("NFC is not supported on this device")]
    NfcUnavailable,

    #[error("NFC is disabled")]
    NfcDisabled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Peripheral not initialized")]
    NotInitialized,
}

impl Error {
    /// 事件通道上使用的稳定错误码
    pub fn code(&self) -> &'static str {
        match self {
            Error::AdapterUnavailable => "BLE_ADAPTER_UNAVAILABLE",
            Error::AdapterDisabled => "BLE_ADAPTER_DISABLED",
            Error::PermissionDenied(_) => "PERMISSION_DENIED",
            Error::AdvertiseFailure(_) => "ADVERTISE_FAILURE",
            Error::ServiceRegistrationFailure(_) => "SERVICE_REGISTRATION_FAILURE",
            Error::Io(_) => "IO_ERROR",
            Error::Protocol { .. } => "PROTOCOL_ERROR",
            Error::UnsupportedTag => "TAG_ERROR",
            Error::NfcUnavailable => "NFC_NOT_SUPPORTED",
            Error::NfcDisabled => "NFC_DISABLED",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::InvalidIdentifier(_) => "INVALID_IDENTIFIER",
            Error::NotInitialized => "NOT_INITIALIZED",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertise_codes_match_android() {
        assert_eq!(AdvertiseErrorCode::DataTooLarge.code(), 1);
        assert_eq!(AdvertiseErrorCode::AlreadyStarted.code(), 3);
        assert_eq!(AdvertiseErrorCode::FeatureUnsupported.code(), 5);
    }

    #[test]
    fn test_protocol_error_message() {
        let err = Error::Protocol {
            step: ExchangeStep::Select,
            status: StatusWord::FILE_NOT_FOUND,
        };
        assert_eq!(err.code(), "PROTOCOL_ERROR");
        assert_eq!(err.to_string(), "SELECT answered 6A82, expected 9000");
    }
}
