//! 权限检查
//!
//! 在任何硬件调用之前同步检查权限，缺少权限时直接返回
//! [`Error::PermissionDenied`](crate::Error::PermissionDenied)，不触碰适配器。

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Permission {
    BluetoothConnect,
    BluetoothAdvertise,
    BluetoothScan,
    Nfc,
}

impl Permission {
    /// BLE 外设角色需要的全部权限
    pub const PERIPHERAL: [Permission; 3] = [
        Permission::BluetoothConnect,
        Permission::BluetoothAdvertise,
        Permission::BluetoothScan,
    ];
}

/// 平台权限查询
pub trait PermissionGate: Send + Sync {
    fn is_granted(&self, permission: Permission) -> bool;

    /// 返回缺少的权限，全部满足时为空
    fn missing(&self, required: &[Permission]) -> Vec<Permission> {
        required
            .iter()
            .copied()
            .filter(|p| !self.is_granted(*p))
            .collect()
    }

    fn check(&self, required: &[Permission]) -> crate::Result<()> {
        let missing = self.missing(required);
        if missing.is_empty() {
            Ok(())
        } else {
            log::error!("Required permissions denied: {:?}", missing);
            Err(crate::Error::PermissionDenied(missing))
        }
    }
}

/// 固定权限集合
///
/// Linux 上 BLE 访问由 BlueZ 的 D-Bus 策略控制，没有运行时授权流程。
#[derive(Debug, Clone, Default)]
pub struct StaticPermissions {
    denied: BTreeSet<Permission>,
}

impl StaticPermissions {
    pub fn granted() -> Self {
        Self::default()
    }

    pub fn deny(mut self, permission: Permission) -> Self {
        self.denied.insert(permission);
        self
    }
}

impl PermissionGate for StaticPermissions {
    fn is_granted(&self, permission: Permission) -> bool {
        !self.denied.contains(&permission)
    }
}
