//! 子命令实现

use anyhow::{Context, Result};
use duolink_core::ble::central::DEFAULT_SCAN_TIMEOUT;
use duolink_core::config::load_hce_config;
use duolink_core::events::{self, EventSink};
use duolink_core::{
    AppSettings, BleCentral, BluezBackend, ConfigStore, DiscoveredTag, ExchangeEvent,
    IdentifierExchange, LoopbackTag, MemoryConfigStore, PeripheralBackend, SimulatedBackend,
    StaticPermissions, TomlConfigStore,
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn open_store() -> Result<Arc<TomlConfigStore>> {
    let path = TomlConfigStore::default_path();
    let store = TomlConfigStore::open(path.clone())
        .with_context(|| format!("Failed to open config store {}", path.display()))?;
    Ok(Arc::new(store))
}

fn build_exchange(
    backend: Arc<dyn PeripheralBackend>,
    store: Arc<dyn ConfigStore>,
    settings: AppSettings,
    events: EventSink,
) -> Result<IdentifierExchange> {
    Ok(IdentifierExchange::new(
        backend,
        Arc::new(StaticPermissions::granted()),
        store,
        settings,
        events,
    )?)
}

pub async fn run_peripheral(name: Option<String>, uuid: Option<Uuid>, echo: bool) -> Result<()> {
    let mut settings = AppSettings::load();
    if let Some(name) = name {
        settings.device_name = name;
    }
    if let Some(uuid) = uuid {
        settings.service_uuid = uuid;
    }

    let (events, mut rx) = events::channel();
    let exchange = build_exchange(
        Arc::new(BluezBackend::new()),
        open_store()?,
        settings,
        events,
    )?;

    exchange.setup_peripheral().await?;
    println!(
        "📡 正在广播为 '{}' (service {})，Ctrl+C 退出",
        exchange.settings().device_name,
        exchange.settings().service_uuid
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = rx.recv() => {
                let Some(event) = event else { break };
                println!("{}", event.to_json());
                if matches!(event, ExchangeEvent::Received { .. }) {
                    while let Some(message) = exchange.poll_received() {
                        println!("📥 {}", message);
                        if echo && !exchange.send(&message).await? {
                            tracing::warn!("Echo not delivered");
                        }
                    }
                }
            }
        }
    }

    exchange.shutdown().await?;
    Ok(())
}

pub async fn run_central(uuid: Option<Uuid>, timeout: u64, messages: Vec<String>) -> Result<()> {
    let uuid = uuid.unwrap_or_else(|| AppSettings::load().service_uuid);
    let central = BleCentral::new(uuid).await?;

    let scan_timeout = if timeout == 0 {
        DEFAULT_SCAN_TIMEOUT
    } else {
        Duration::from_secs(timeout)
    };
    let mut notifications = central.connect(scan_timeout).await?;
    println!("🔗 已连接 (service {})", uuid);

    for message in &messages {
        central.send(message).await?;
        println!("📤 {}", message);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            text = notifications.recv() => match text {
                Some(text) => println!("📥 {}", text),
                None => break,
            },
        }
    }

    central.disconnect().await?;
    Ok(())
}

pub fn hce_set(aid: &str, identifier: &str) -> Result<()> {
    let store = open_store()?;
    let (events, _rx) = events::channel();
    let exchange = build_exchange(
        Arc::new(SimulatedBackend::without_adapter()),
        store,
        AppSettings::load(),
        events,
    )?;
    exchange.configure_hce(aid, identifier)?;

    let config = exchange.hce_config();
    println!("✅ AID: {}", config.aid());
    println!("   标识符: {}", config.identifier());
    Ok(())
}

pub fn hce_show() -> Result<()> {
    let store = open_store()?;
    let config = load_hce_config(store.as_ref())?;
    println!("AID: {}", config.aid());
    println!("标识符: {}", config.identifier());
    println!();
    println!("{}", toml::to_string_pretty(&AppSettings::load())?);
    Ok(())
}

pub fn hce_apdu(command: &str) -> Result<()> {
    let apdu = duolink_core::nfc::apdu::decode_hex(command)
        .with_context(|| format!("'{}' is not a hex APDU", command))?;

    let store = open_store()?;
    let (events, _rx) = events::channel();
    let exchange = build_exchange(
        Arc::new(SimulatedBackend::without_adapter()),
        store,
        AppSettings::load(),
        events,
    )?;
    println!("{}", hex::encode_upper(exchange.handle_apdu(&apdu)));
    Ok(())
}

#[cfg(feature = "pcsc")]
pub async fn run_read(selector: &str, timeout: u64) -> Result<()> {
    use duolink_core::nfc::PcscReader;

    let store = open_store()?;
    let (events, mut rx) = events::channel();
    let exchange = build_exchange(
        Arc::new(SimulatedBackend::without_adapter()),
        store,
        AppSettings::load(),
        events,
    )?;

    let reader = PcscReader::new()?;
    exchange.check_nfc_reader(&reader).await?;

    println!("📶 请把设备靠近读卡器...");
    let Some(tag) = reader.wait_for_tag(Duration::from_secs(timeout)).await? else {
        anyhow::bail!("No tag presented within {}s", timeout);
    };

    let result = exchange.send_over_nfc_reader(tag, selector).await;
    while let Ok(event) = rx.try_recv() {
        println!("{}", event.to_json());
    }
    println!("🆔 {}", result?);
    Ok(())
}

#[cfg(not(feature = "pcsc"))]
pub async fn run_read(_selector: &str, _timeout: u64) -> Result<()> {
    anyhow::bail!("duolink was built without the `pcsc` feature")
}

/// 两个模拟端点：一个 BLE 外设，一个卡模拟 + 读卡端
pub async fn run_demo() -> Result<()> {
    const PEER: &str = "02:00:00:00:00:01";

    let backend = Arc::new(SimulatedBackend::new());
    let settings = AppSettings {
        device_name: "duolink-demo".to_string(),
        ..Default::default()
    };
    let uuid = settings.service_uuid;
    let (events, mut rx) = events::channel();
    let exchange = build_exchange(
        backend.clone(),
        Arc::new(MemoryConfigStore::new()),
        settings,
        events,
    )?;

    println!("== BLE ==");
    exchange.setup_peripheral().await?;
    backend.connect_peer(PEER, Some("demo-phone"));
    backend.subscribe(uuid);
    backend.write(PEER, uuid, b"Hello");

    loop {
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .context("Timed out waiting for simulated write")?
            .context("Event channel closed")?;
        println!("{}", event.to_json());
        if matches!(event, ExchangeEvent::Received { .. }) {
            break;
        }
    }

    if let Some(message) = exchange.poll_received() {
        println!("📥 {}", message);
        exchange.send(&format!("ack: {}", message)).await?;
    }
    for sent in backend.notifications() {
        println!(
            "📤 notify {} -> {}",
            sent.peer,
            String::from_utf8_lossy(&sent.payload)
        );
    }

    println!("== NFC ==");
    exchange.configure_hce("F00000000A0101", "12345678-1234-5678-1234-567812345678")?;
    let tag = DiscoveredTag::IsoDep(Box::new(LoopbackTag::new(exchange.hce())));
    let identifier = exchange.send_over_nfc_reader(tag, "").await?;
    println!("🆔 {}", identifier);

    exchange.shutdown().await?;
    Ok(())
}
