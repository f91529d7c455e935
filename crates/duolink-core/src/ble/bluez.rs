//! BlueZ 外设后端
//!
//! 通过 bluer (BlueZ D-Bus) 实现广播、GATT Server 和通知。
//!
//! # 注意
//!
//! - BlueZ 自己管理 CCCD (0x2902)，描述符列表中的 CCCD 不会重复注册，
//!   订阅状态通过 `CharacteristicNotify` 回调获得。
//! - BlueZ 无法精确控制广播包和扫描响应的分布，发射功率通过 `system_includes`
//!   交给 BlueZ 填充，服务数据放在扫描响应里。

use crate::ble::CCCD_UUID;
use crate::ble::adv::PeripheralAdvertisement;
use crate::ble::backend::{AdapterStatus, HardwareEvent, HardwareEventSender, PeripheralBackend};
use crate::ble::connection::ConnectionState;
use crate::ble::gatt::{
    AttributePermissions, CharacteristicDescriptor, CharacteristicProperties,
    GattServiceDescriptor, ServiceType,
};
use crate::error::AdvertiseErrorCode;
use crate::{Error, Result};
use async_trait::async_trait;
use bluer::adv::{Advertisement, AdvertisementHandle, Feature, Type};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotifier, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicWrite,
    CharacteristicWriteMethod, Descriptor, DescriptorWrite, Service,
};
use bluer::{Adapter, AdapterEvent, Address, DeviceEvent, DeviceProperty, ErrorKind, Session};
use futures_util::{FutureExt, StreamExt};
use log::{debug, error, info, trace, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

type Notifiers = Arc<Mutex<HashMap<Uuid, CharacteristicNotifier>>>;

struct ServerState {
    _app_handle: ApplicationHandle,
    monitor: JoinHandle<()>,
    notifiers: Notifiers,
    events: HardwareEventSender,
}

#[derive(Default)]
struct BluezState {
    session: Option<(Session, Adapter)>,
    advertisement: Option<AdvertisementHandle>,
    server: Option<ServerState>,
}

/// 基于 BlueZ 的外设后端
#[derive(Default)]
pub struct BluezBackend {
    adapter_name: Option<String>,
    state: Mutex<BluezState>,
}

impl BluezBackend {
    /// 使用默认适配器
    pub fn new() -> Self {
        Self::default()
    }

    /// 使用指定名称的适配器，例如 `hci1`
    pub fn with_adapter(name: &str) -> Self {
        Self {
            adapter_name: Some(name.to_string()),
            state: Mutex::default(),
        }
    }

    /// 按需建立 D-Bus 会话并解析适配器
    async fn adapter(&self) -> Result<Adapter> {
        let mut state = self.state.lock().await;
        if let Some((_, adapter)) = &state.session {
            return Ok(adapter.clone());
        }

        debug!("Initializing BLE session...");
        let session = Session::new().await.map_err(|e| {
            error!("Failed to open BlueZ session: {}", e);
            Error::AdapterUnavailable
        })?;

        let adapter = match &self.adapter_name {
            Some(name) => session.adapter(name),
            None => session.default_adapter().await,
        }
        .map_err(|e| {
            error!("No usable Bluetooth adapter: {}", e);
            Error::AdapterUnavailable
        })?;

        debug!("Using adapter: {}", adapter.name());
        state.session = Some((session, adapter.clone()));
        Ok(adapter)
    }

    fn build_advertisement(advertisement: &PeripheralAdvertisement) -> Advertisement {
        let settings = &advertisement.settings;

        let mut service_data = BTreeMap::new();
        if let Some((uuid, payload)) = &advertisement.scan_response.service_data {
            service_data.insert(*uuid, payload.clone());
        }

        let mut system_includes = BTreeSet::new();
        if advertisement.advertise_data.include_tx_power
            || advertisement.scan_response.include_tx_power
        {
            system_includes.insert(Feature::TxPower);
        }

        let local_name = (advertisement.advertise_data.include_device_name
            && !advertisement.device_name.is_empty())
        .then(|| advertisement.device_name.clone());

        Advertisement {
            advertisement_type: if settings.connectable {
                Type::Peripheral
            } else {
                Type::Broadcast
            },
            service_data,
            local_name,
            discoverable: Some(settings.connectable),
            system_includes,
            min_interval: Some(settings.mode.interval()),
            max_interval: Some(settings.mode.interval()),
            tx_power: Some(i16::from(settings.tx_power.dbm())),
            timeout: settings.timeout,
            ..Default::default()
        }
    }
}

fn advertise_error_code(e: &bluer::Error) -> AdvertiseErrorCode {
    match e.kind {
        ErrorKind::InvalidLength => AdvertiseErrorCode::DataTooLarge,
        ErrorKind::AlreadyExists => AdvertiseErrorCode::AlreadyStarted,
        ErrorKind::NotSupported => AdvertiseErrorCode::FeatureUnsupported,
        ErrorKind::NotPermitted => AdvertiseErrorCode::TooManyAdvertisers,
        _ => AdvertiseErrorCode::InternalError,
    }
}

fn build_characteristic(
    desc: &CharacteristicDescriptor,
    events: &HardwareEventSender,
    notifiers: &Notifiers,
) -> Characteristic {
    let uuid = desc.uuid;
    let props = desc.properties;

    // 读：立即成功返回空值，请求本身交给上层记录
    let read = props.contains(CharacteristicProperties::READ).then(|| {
        let events = events.clone();
        CharacteristicRead {
            read: true,
            encrypt_read: desc
                .permissions
                .contains(AttributePermissions::READ_ENCRYPTED),
            fun: Box::new(move |req| {
                let events = events.clone();
                async move {
                    let _ = events.send(HardwareEvent::CharacteristicRead {
                        address: req.device_address.to_string(),
                        characteristic: uuid,
                        offset: req.offset,
                    });
                    Ok(Vec::new())
                }
                .boxed()
            }),
            ..Default::default()
        }
    });

    // 写：BlueZ 会按写类型过滤，两种写都打开
    let writable = props.contains(CharacteristicProperties::WRITE)
        || props.contains(CharacteristicProperties::WRITE_NO_RESPONSE);
    let write = writable.then(|| {
        let events = events.clone();
        CharacteristicWrite {
            write: true,
            write_without_response: true,
            encrypt_write: desc
                .permissions
                .contains(AttributePermissions::WRITE_ENCRYPTED),
            method: CharacteristicWriteMethod::Fun(Box::new(move |value, req| {
                let events = events.clone();
                async move {
                    trace!(
                        "Characteristic {} write from {}: {} bytes",
                        uuid,
                        req.device_address,
                        value.len()
                    );
                    if events
                        .send(HardwareEvent::CharacteristicWrite {
                            address: req.device_address.to_string(),
                            characteristic: uuid,
                            value,
                        })
                        .is_err()
                    {
                        warn!("Write on {} after dispatcher stopped", uuid);
                    }
                    Ok(())
                }
                .boxed()
            })),
            ..Default::default()
        }
    });

    let notifiable = props.contains(CharacteristicProperties::NOTIFY)
        || props.contains(CharacteristicProperties::INDICATE);
    let notify = notifiable.then(|| {
        let events = events.clone();
        let notifiers = notifiers.clone();
        CharacteristicNotify {
            notify: props.contains(CharacteristicProperties::NOTIFY),
            indicate: props.contains(CharacteristicProperties::INDICATE),
            method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                let events = events.clone();
                let notifiers = notifiers.clone();
                async move {
                    debug!("Notification session started on {}", uuid);
                    notifiers.lock().await.insert(uuid, notifier);
                    let _ = events.send(HardwareEvent::NotificationsEnabled {
                        characteristic: uuid,
                    });
                }
                .boxed()
            })),
            ..Default::default()
        }
    });

    let descriptors = desc
        .descriptor
        .iter()
        .filter(|d| d.uuid != CCCD_UUID)
        .map(|d| {
            let descriptor_uuid = d.uuid;
            let events = events.clone();
            Descriptor {
                uuid: descriptor_uuid,
                write: Some(DescriptorWrite {
                    write: d.permissions.contains(AttributePermissions::WRITE),
                    fun: Box::new(move |value, _req| {
                        let events = events.clone();
                        async move {
                            let _ = events.send(HardwareEvent::DescriptorWrite {
                                descriptor: descriptor_uuid,
                                value,
                            });
                            Ok(())
                        }
                        .boxed()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }
        })
        .collect();

    Characteristic {
        uuid,
        broadcast: props.contains(CharacteristicProperties::BROADCAST),
        read,
        write,
        notify,
        descriptors,
        ..Default::default()
    }
}

/// 监听适配器上设备的连接状态变化
async fn monitor_connections(adapter: Adapter, events: HardwareEventSender) {
    let adapter_events = match adapter.events().await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to subscribe to adapter events: {}", e);
            return;
        }
    };
    futures_util::pin_mut!(adapter_events);

    let mut watched: HashSet<Address> = HashSet::new();
    let mut watchers = JoinSet::new();

    if let Ok(addresses) = adapter.device_addresses().await {
        for address in addresses {
            if watched.insert(address) {
                watchers.spawn(watch_device(adapter.clone(), address, events.clone()));
            }
        }
    }

    loop {
        tokio::select! {
            event = adapter_events.next() => match event {
                Some(AdapterEvent::DeviceAdded(address)) => {
                    if watched.insert(address) {
                        watchers.spawn(watch_device(adapter.clone(), address, events.clone()));
                    }
                }
                Some(AdapterEvent::DeviceRemoved(address)) => {
                    watched.remove(&address);
                }
                Some(_) => {}
                None => break,
            },
            Some(finished) = watchers.join_next() => {
                if let Ok(address) = finished {
                    watched.remove(&address);
                }
            }
        }
        if events.is_closed() {
            break;
        }
    }
    debug!("Connection monitor stopped");
}

async fn watch_device(adapter: Adapter, address: Address, events: HardwareEventSender) -> Address {
    let Ok(device) = adapter.device(address) else {
        return address;
    };
    let Ok(device_events) = device.events().await else {
        return address;
    };
    futures_util::pin_mut!(device_events);

    while let Some(DeviceEvent::PropertyChanged(property)) = device_events.next().await {
        if let DeviceProperty::Connected(connected) = property {
            let name = device.name().await.ok().flatten();
            let state = if connected {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            };
            if events
                .send(HardwareEvent::ConnectionStateChanged {
                    address: address.to_string(),
                    name,
                    state,
                })
                .is_err()
            {
                break;
            }
        }
    }
    address
}

#[async_trait]
impl PeripheralBackend for BluezBackend {
    async fn adapter_status(&self) -> Result<AdapterStatus> {
        let adapter = self.adapter().await?;
        let powered = adapter.is_powered().await.map_err(|e| {
            error!("Failed to query adapter power state: {}", e);
            Error::AdapterUnavailable
        })?;
        Ok(if powered {
            AdapterStatus::Enabled
        } else {
            AdapterStatus::Disabled
        })
    }

    async fn request_enable(&self) {
        let Ok(adapter) = self.adapter().await else {
            return;
        };
        tokio::spawn(async move {
            debug!("Powering on adapter: {}", adapter.name());
            if let Err(e) = adapter.set_powered(true).await {
                warn!("Failed to power on adapter {}: {}", adapter.name(), e);
            }
        });
    }

    async fn start_advertising(
        &self,
        advertisement: &PeripheralAdvertisement,
    ) -> std::result::Result<(), AdvertiseErrorCode> {
        advertisement.validate()?;
        let adapter = self
            .adapter()
            .await
            .map_err(|_| AdvertiseErrorCode::InternalError)?;

        let mut state = self.state.lock().await;
        if state.advertisement.is_some() {
            return Err(AdvertiseErrorCode::AlreadyStarted);
        }

        let adv = Self::build_advertisement(advertisement);
        debug!(
            "Starting BLE advertisement: service_uuid={}, local_name={:?}",
            advertisement.service_uuid, adv.local_name
        );
        let handle = adapter.advertise(adv).await.map_err(|e| {
            error!("BlueZ rejected advertisement: {}", e);
            advertise_error_code(&e)
        })?;
        state.advertisement = Some(handle);
        info!(
            "Advertising started on {}, device_name='{}'",
            adapter.name(),
            advertisement.device_name
        );
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        // drop handle 即注销广播
        if self.state.lock().await.advertisement.take().is_some() {
            info!("Advertising stopped");
        }
        Ok(())
    }

    async fn open_gatt_server(
        &self,
        service: &GattServiceDescriptor,
        events: HardwareEventSender,
    ) -> Result<bool> {
        let adapter = self.adapter().await?;
        let notifiers: Notifiers = Arc::default();

        let characteristics = service
            .characteristics
            .iter()
            .map(|c| build_characteristic(c, &events, &notifiers))
            .collect();

        let app = Application {
            services: vec![Service {
                uuid: service.uuid,
                primary: service.service_type == ServiceType::Primary,
                characteristics,
                ..Default::default()
            }],
            ..Default::default()
        };

        debug!(
            "Registering GATT application with service_uuid={}",
            service.uuid
        );
        let app_handle = match adapter.serve_gatt_application(app).await {
            Ok(handle) => handle,
            Err(e) => {
                error!("GATT application registration failed: {}", e);
                return Ok(false);
            }
        };
        debug!("GATT application registered successfully");

        let monitor = tokio::spawn(monitor_connections(adapter, events.clone()));

        let mut state = self.state.lock().await;
        if let Some(previous) = state.server.replace(ServerState {
            _app_handle: app_handle,
            monitor,
            notifiers,
            events,
        }) {
            previous.monitor.abort();
        }
        Ok(true)
    }

    async fn close_gatt_server(&self) {
        if let Some(server) = self.state.lock().await.server.take() {
            server.monitor.abort();
            info!("GATT server closed");
        }
    }

    async fn notify(&self, peer: &str, characteristic: Uuid, payload: &[u8]) -> Result<bool> {
        let (notifiers, events) = match &self.state.lock().await.server {
            Some(server) => (server.notifiers.clone(), server.events.clone()),
            None => return Ok(false),
        };

        let mut notifiers = notifiers.lock().await;
        let Some(notifier) = notifiers.get_mut(&characteristic) else {
            debug!("No subscriber on {}, notification to {} skipped", characteristic, peer);
            return Ok(false);
        };

        // BlueZ 把通知发给该特征的所有订阅者
        if notifier.is_stopped() {
            debug!("Notification session on {} stopped by peer", characteristic);
        } else {
            match notifier.notify(payload.to_vec()).await {
                Ok(()) => {
                    trace!("Notified {} bytes on {} (peer {})", payload.len(), characteristic, peer);
                    return Ok(true);
                }
                Err(e) => warn!("Notification on {} failed: {}", characteristic, e),
            }
        }

        notifiers.remove(&characteristic);
        let _ = events.send(HardwareEvent::NotificationsDisabled { characteristic });
        Ok(false)
    }
}
