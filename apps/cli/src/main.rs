//! # Rover CLI
//!
//! Command-line runner for rover sensor pipelines.
//!
//! ## 运行描述文件
//!
//! ```bash
//! # 运行 TOML / JSON 描述的流水线，Ctrl-C 结束
//! rover-cli run --config apps/cli/pipelines/sensors.toml
//!
//! # 运行 10 秒后自动停止
//! rover-cli run --config pipeline.json --duration-secs 10
//! ```
//!
//! 描述文件中 `[[inputs]]` 声明的外部输入由模拟传感器驱动；
//! 也可以直接使用 `kind = "sensor"` 的步骤作为流水线内的数据源。
//!
//! ## 多传感器对齐演示
//!
//! ```bash
//! rover-cli demo --sources 4 --rate-hz 50
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod sensor;
mod utils;

use commands::{DemoCommand, RunCommand};

/// Rover CLI - 传感器流水线命令行工具
#[derive(Parser, Debug)]
#[command(name = "rover-cli")]
#[command(about = "Command-line runner for rover sensor pipelines", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 运行描述文件中的流水线
    Run {
        #[command(flatten)]
        args: RunCommand,
    },

    /// 多传感器时间对齐演示
    Demo {
        #[command(flatten)]
        args: DemoCommand,
    },
}

fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rover_cli=info".parse()?)
                .add_directive("rover_pipeline=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { args } => args.execute(),
        Commands::Demo { args } => args.execute(),
    }
}
