use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use rs_automation::config::{ExecOptions, RunFlags, DEFAULT_ACTIVITY_TIMEOUT_MINUTES};
use rs_automation::env::parse_env_assignments;
use rs_automation::log::RunLogger;
use rs_automation::ui::{NoopSpinner, ProgressSpinner, Spinner};
use rs_automation::{
    load_operations, prepare_operations, resolve_hosts, validate_operations, InventoryHandle,
    OnetunVpn, Operation, OperationRunner, RunContext, VpnSettings, VpnTunnel,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "rs-automation", version, about = "Run operations on many hosts over SSH")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 在主机上执行一条命令或一个操作文件
    Run(RunArgs),
}

#[derive(Args)]
#[command(disable_help_flag = true)]
struct RunArgs {
    /// 单条命令
    #[arg(short = 'c', long, conflicts_with = "operations")]
    command: Option<String>,

    /// YAML 操作文件
    #[arg(short = 'o', long)]
    operations: Option<PathBuf>,

    /// 目标主机，可重复；`address[:port[:login]]` 或清单中的组名
    #[arg(short = 'h', long = "host", required = true, action = clap::ArgAction::Append)]
    hosts: Vec<String>,

    /// 环境变量 KEY=value，覆盖操作中的同名变量
    #[arg(short = 'e', long = "env", action = clap::ArgAction::Append)]
    env: Vec<String>,

    #[arg(short = 'i', long)]
    inventory: Option<PathBuf>,

    #[arg(long = "sshpk")]
    ssh_private_key: Option<PathBuf>,

    #[arg(long = "sshpass")]
    ssh_passphrase: Option<String>,

    #[arg(long)]
    sudo: bool,

    #[arg(long = "sudopass")]
    sudo_password: Option<String>,

    /// 以 JSON 输出报告
    #[arg(long)]
    json: bool,

    /// 无活动超时（分钟）
    #[arg(long, default_value_t = DEFAULT_ACTIVITY_TIMEOUT_MINUTES)]
    activity_timeout: u64,

    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// copyTo 相对路径的基准目录
    #[arg(long, env = "OPS")]
    ops_dir: Option<PathBuf>,

    /// WireGuard 设置（YAML），缺省时读取清单中的 internalVpn
    #[arg(long)]
    vpn_config: Option<PathBuf>,

    /// 同一操作内的最大并发主机数，缺省不限制
    #[arg(short = 'f', long)]
    forks: Option<usize>,

    #[arg(long, action = clap::ArgAction::Help)]
    help: Option<bool>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化tracing日志
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let exit_code = match cli.command {
        Commands::Run(args) => run(args).await?,
    };
    std::process::exit(exit_code);
}

async fn run(args: RunArgs) -> anyhow::Result<i32> {
    let flags = RunFlags::from_env();
    let cli_environment = parse_env_assignments(&args.env)?;

    let mut operations = match (&args.command, &args.operations) {
        (Some(command), None) => vec![Operation::command("Command line", command)],
        (None, Some(path)) => load_operations(path)
            .with_context(|| format!("Unable to load operations from {}", path.display()))?,
        _ => bail!("Provide either a command (-c) or an operations file (-o)"),
    };

    let inventory_handle = args.inventory.clone().map(InventoryHandle::new);
    let inventory = inventory_handle
        .as_ref()
        .map(|handle| handle.snapshot())
        .transpose()
        .context("Unable to read the inventory")?;

    let mut hosts = resolve_hosts(&args.hosts, inventory.as_deref())?;
    if hosts.is_empty() {
        bail!("No host to process");
    }
    debug!("hosts: {:?}", hosts);

    prepare_operations(&mut operations, &cli_environment);
    validate_operations(&operations, &hosts, inventory.is_some())?;

    let vpn = match args.vpn_config.as_ref() {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Unable to read VPN settings {}", path.display()))?;
            Some(serde_yaml::from_str::<VpnSettings>(&raw).context("Invalid VPN settings")?)
        }
        None => inventory.as_deref().and_then(VpnSettings::from_inventory),
    };

    let mut options = ExecOptions {
        inventory_file: args.inventory.clone(),
        ssh_private_key: args.ssh_private_key,
        ssh_passphrase: args.ssh_passphrase,
        sudo: args.sudo,
        sudo_password: args.sudo_password,
        activity_timeout_minutes: args.activity_timeout,
        json_report: args.json,
        vpn,
        ..Default::default()
    };
    if let Some(ops_dir) = args.ops_dir {
        options.ops_directory = ops_dir;
    }
    if let Some(log_dir) = args.log_dir {
        options.log_directory = log_dir;
    }

    let mut tunnel = OnetunVpn::from_ops_directory(&options.ops_directory);
    if let Some(settings) = options.vpn.as_ref() {
        if let Some(pid) = tunnel.start(&mut hosts, settings).await? {
            info!("VPN tunnel started (pid {})", pid);
        }
    }

    let logger = if flags.nolog {
        RunLogger::disabled()
    } else {
        RunLogger::new(&options.log_directory)
    };
    // TESTMODE 下不绘制终端动画
    let spinner: Arc<dyn Spinner> = if flags.silent || flags.test_mode {
        Arc::new(NoopSpinner)
    } else {
        Arc::new(ProgressSpinner::new("Running operations..."))
    };
    let ctx = RunContext::new(flags, logger)
        .with_inventory(inventory_handle)
        .with_spinner(spinner);

    let mut runner = OperationRunner::new(Arc::new(ctx), Arc::new(options))?;
    if let Some(forks) = args.forks {
        runner = runner.with_max_concurrent_hosts(forks);
    }
    let summary = runner.run(&operations, &hosts).await;

    tunnel.close().await;
    Ok(summary.exit_code)
}
