//! Duolink CLI
//!
//! 命令行前端：BLE 外设 / 中心端、卡模拟配置、读卡和无硬件演示

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "duolink", version, about = "通过 BLE 和 NFC 交换设备标识符")]
struct Cli {
    /// 输出调试日志
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 作为 BLE 外设广播并等待写入
    Peripheral {
        /// 广播名称 (默认: 设置中的设备名称)
        #[arg(short, long)]
        name: Option<String>,
        /// 交换服务 UUID (默认: 设置中的 UUID)
        #[arg(short, long)]
        uuid: Option<Uuid>,
        /// 把收到的消息原样通知回去
        #[arg(long)]
        echo: bool,
    },
    /// 作为 BLE 中心端连接外设并发送消息
    Central {
        #[arg(short, long)]
        uuid: Option<Uuid>,
        /// 扫描超时时间 (秒)
        #[arg(short, long, default_value = "3")]
        timeout: u64,
        /// 要发送的消息
        messages: Vec<String>,
    },
    /// 卡模拟配置
    Hce {
        #[command(subcommand)]
        action: HceAction,
    },
    /// 从 PC/SC 读卡器读取对端标识符
    Read {
        /// 附加在 GET DATA 后的十六进制数据
        #[arg(short, long, default_value = "")]
        selector: String,
        /// 等待标签的时间 (秒)
        #[arg(short, long, default_value = "30")]
        timeout: u64,
    },
    /// 使用模拟后端演示完整流程
    Demo,
}

#[derive(Subcommand)]
enum HceAction {
    /// 设置 AID 和标识符
    Set { aid: String, identifier: String },
    /// 查看当前配置
    Show,
    /// 把一条十六进制 APDU 交给卡模拟分发器
    Apdu { command: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 桥接 log crate（duolink-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let default_filter = if cli.verbose {
        "debug"
    } else {
        "info,duolink_core=debug"
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .try_init();

    match cli.command {
        Commands::Peripheral { name, uuid, echo } => {
            commands::run_peripheral(name, uuid, echo).await?;
        }
        Commands::Central {
            uuid,
            timeout,
            messages,
        } => {
            commands::run_central(uuid, timeout, messages).await?;
        }
        Commands::Hce { action } => match action {
            HceAction::Set { aid, identifier } => commands::hce_set(&aid, &identifier)?,
            HceAction::Show => commands::hce_show()?,
            HceAction::Apdu { command } => commands::hce_apdu(&command)?,
        },
        Commands::Read { selector, timeout } => {
            commands::run_read(&selector, timeout).await?;
        }
        Commands::Demo => commands::run_demo().await?,
    }

    Ok(())
}
