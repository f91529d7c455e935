//! GATT 服务描述
//!
//! 注册到 GATT Server 之前的服务/特征/描述符树。注册后不可修改。

use crate::ble::CCCD_UUID;
use std::ops::BitOr;
use uuid::Uuid;

/// 特征属性位 (Bluetooth Core Spec Vol 3, Part G, 3.3.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    pub const BROADCAST: Self = Self(0x01);
    pub const READ: Self = Self(0x02);
    pub const WRITE_NO_RESPONSE: Self = Self(0x04);
    pub const WRITE: Self = Self(0x08);
    pub const NOTIFY: Self = Self(0x10);
    pub const INDICATE: Self = Self(0x20);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// 属性访问权限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttributePermissions(u16);

impl AttributePermissions {
    pub const READ: Self = Self(0x01);
    pub const READ_ENCRYPTED: Self = Self(0x02);
    pub const WRITE: Self = Self(0x10);
    pub const WRITE_ENCRYPTED: Self = Self(0x20);

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AttributePermissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorInfo {
    pub uuid: Uuid,
    pub permissions: AttributePermissions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub permissions: AttributePermissions,
    pub descriptor: Option<DescriptorInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattServiceDescriptor {
    pub uuid: Uuid,
    pub service_type: ServiceType,
    pub characteristics: Vec<CharacteristicDescriptor>,
}

impl GattServiceDescriptor {
    /// 标识符交换服务
    ///
    /// 一个主服务，一个 `WRITE | NOTIFY` 特征（权限 `WRITE`），
    /// 特征带一个 CCCD 描述符（权限 `WRITE`）。特征 UUID 与服务 UUID 相同。
    pub fn exchange_service(uuid: Uuid) -> Self {
        Self {
            uuid,
            service_type: ServiceType::Primary,
            characteristics: vec![CharacteristicDescriptor {
                uuid,
                properties: CharacteristicProperties::WRITE | CharacteristicProperties::NOTIFY,
                permissions: AttributePermissions::WRITE,
                descriptor: Some(DescriptorInfo {
                    uuid: CCCD_UUID,
                    permissions: AttributePermissions::WRITE,
                }),
            }],
        }
    }

    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicDescriptor> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_service_layout() {
        let uuid = Uuid::from_u128(0x12345678_1234_5678_1234_567812345002);
        let service = GattServiceDescriptor::exchange_service(uuid);

        assert_eq!(service.service_type, ServiceType::Primary);
        assert_eq!(service.characteristics.len(), 1);

        let ch = service.characteristic(uuid).unwrap();
        assert!(ch.properties.contains(CharacteristicProperties::WRITE));
        assert!(ch.properties.contains(CharacteristicProperties::NOTIFY));
        assert!(!ch.properties.contains(CharacteristicProperties::READ));
        assert_eq!(ch.permissions, AttributePermissions::WRITE);

        let desc = ch.descriptor.as_ref().unwrap();
        assert_eq!(
            desc.uuid.to_string(),
            "00002902-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(desc.permissions, AttributePermissions::WRITE);
    }

    #[test]
    fn test_property_bits() {
        let props = CharacteristicProperties::WRITE | CharacteristicProperties::NOTIFY;
        assert_eq!(props.bits(), 0x18);
    }
}
