//! 命令行入口
//! 在一个或多个目标主机上执行一批命令并打印结果

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use ops_executor::models::host::parse_target;
use ops_executor::{telemetry, Executor, ExecutorConfig};

#[derive(Parser, Debug)]
#[command(name = "ops-exec", version, about = "Run shell commands on remote hosts over SSH")]
struct Arguments {
    /// 目标主机 `user@host[:port]`，可重复
    #[arg(short, long = "target", required = true)]
    targets: Vec<String>,

    /// 登录密码（缺省使用 OPS_SSH__DEFAULT_PASSWORD）
    #[arg(short, long)]
    password: Option<String>,

    /// 以独占方式执行每条命令（前一条完成后再下发下一条）
    #[arg(short, long)]
    exclusive: bool,

    /// 输出 JSON
    #[arg(long)]
    json: bool,

    /// 文本输出时每条结果最多显示的字节数
    #[arg(long)]
    max_output: Option<usize>,

    /// 要执行的命令
    #[arg(required = true, trailing_var_arg = true)]
    commands: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Arguments::parse();

    // 加载 .env 文件（开发环境）
    dotenv::dotenv().ok();

    let config = ExecutorConfig::from_env().context("Failed to load configuration")?;
    if let Err(e) = telemetry::init_telemetry(&config.logging) {
        eprintln!("Telemetry disabled: {}", e);
    }

    let executor = Executor::from_config(&config)?;
    let password = args
        .password
        .as_deref()
        .or_else(|| config.ssh.default_password());

    for target in &args.targets {
        let (username, address) = match target.split_once('@') {
            Some((username, address)) => (username, address),
            None => (config.ssh.default_username.as_str(), target.as_str()),
        };
        let (address, port) = parse_target(address)?;

        let host = executor.create_host(&address, port)?;
        let user = executor.create_user(username, password)?;
        let connection = executor.create_connection(&host, &user).await?;
        executor
            .connect(Some(&connection))
            .await
            .with_context(|| format!("Failed to connect to {}", connection.key()))?;
    }

    let commands = args
        .commands
        .iter()
        .map(|text| {
            if args.exclusive {
                executor.create_exclusive_command(text)
            } else {
                executor.create_command(text)
            }
        })
        .collect::<Result<Vec<Arc<_>>, _>>()?;

    let results = executor.execute_batch_everywhere(commands).await?;
    let waited = executor.wait(&results).await;

    let mut failed = false;
    for result in results.iter().flatten() {
        let summary = result.summary();
        failed |= !summary.is_success();
        if args.json {
            println!("{}", serde_json::to_string(&summary)?);
        } else {
            println!("[{}]$ {}", summary.connection, summary.command);
            let output = match args.max_output {
                Some(max_len) => summary.output_summary(max_len),
                None => summary.full_output(),
            };
            if !output.is_empty() {
                println!("{}", output);
            }
            println!("exit code: {:?}", summary.exit_code);
        }
    }

    for connection in executor.iter_connections() {
        if let Err(e) = executor.close_connection(Some(&connection)).await {
            tracing::warn!(connection = %connection.key(), error = %e, "Failed to close connection");
        }
    }

    waited?;
    if failed {
        std::process::exit(1);
    }
    Ok(())
}
