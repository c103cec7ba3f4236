use clap::{Parser, Subcommand};
use sdtool_core::{Device, DeviceManager, FnProgress, SafetyCheck, ToolConfig};
use sdtool_engine::external::{CommandFat32Formatter, CommandTableRefresher, CommandTreeCopier};
use sdtool_engine::{cleanup_engine, MigrationEngine, MigrationPlan};
use sdtool_partitioner::{plan_layout, scan_disk, MigrationOptions, PlanMode};
use sdtool_platform::{PlatformDeviceManager, PlatformGateway};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "sdtool")]
#[command(about = "Migrate and restructure Nintendo Switch SD card partition layouts", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Suppress all but error-level logging
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List candidate SD/USB devices and, optionally, scan one
    Scan {
        /// Device identifier; prints a device list if omitted
        device: Option<String>,
        /// Emit the scanned layout as JSON
        #[arg(long)]
        json: bool,
    },
    /// Compute and print a target layout without writing anything
    Plan {
        device: String,
        /// Target total size in bytes
        #[arg(long)]
        target_bytes: u64,
        #[arg(long, default_value_t = true)]
        fat32: bool,
        #[arg(long, default_value_t = true)]
        linux: bool,
        #[arg(long, default_value_t = true)]
        android: bool,
        #[arg(long, default_value_t = true)]
        emummc: bool,
        #[arg(long, default_value_t = true)]
        expand_fat32: bool,
    },
    /// Clone source onto a larger target, expanding FAT32
    Migrate {
        source_device: String,
        target_device: String,
        #[arg(long)]
        target_bytes: u64,
        /// Mount point of the source FAT32 partition
        #[arg(long)]
        source_mount: PathBuf,
    },
    /// Restructure a single card in place
    Cleanup {
        device: String,
        #[arg(long)]
        target_bytes: u64,
        #[arg(long)]
        source_mount: PathBuf,
        #[arg(long)]
        backup_dir: PathBuf,
    },
}

fn init_logging(cli: &Cli, config: &ToolConfig) {
    let level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => config.log_level.as_str(),
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ToolConfig::load_or_default(&PathBuf::from("sdtool.toml"))?;
    init_logging(&cli, &config);

    match &cli.command {
        Commands::Scan { device, json } => run_scan(device.as_deref(), *json).await,
        Commands::Plan {
            device,
            target_bytes,
            fat32,
            linux,
            android,
            emummc,
            expand_fat32,
        } => {
            run_plan(
                device,
                *target_bytes,
                MigrationOptions {
                    fat32: *fat32,
                    linux: *linux,
                    android: *android,
                    emummc: *emummc,
                    expand_fat32: *expand_fat32,
                },
                config.end_reserve_mib,
            )
            .await
        }
        Commands::Migrate {
            source_device,
            target_device,
            target_bytes,
            source_mount,
        } => run_migrate(source_device, target_device, *target_bytes, source_mount, &config).await,
        Commands::Cleanup {
            device,
            target_bytes,
            source_mount,
            backup_dir,
        } => run_cleanup(device, *target_bytes, source_mount, backup_dir, &config).await,
    }
}

async fn find_device(manager: &dyn DeviceManager, id: &str) -> anyhow::Result<Device> {
    manager
        .get_device_by_id(id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("device not found: {id}"))
}

async fn run_scan(device: Option<&str>, json: bool) -> anyhow::Result<()> {
    let manager = PlatformDeviceManager;
    let Some(device_id) = device else {
        let devices = manager.enumerate_devices().await?;
        if devices.is_empty() {
            println!("No candidate devices found.");
        }
        for device in devices {
            println!("{} ({:?}, {:.2} GiB)", device.id, device.device_type, device.size as f64 / (1024.0 * 1024.0 * 1024.0));
        }
        return Ok(());
    };

    let target = find_device(&manager, device_id).await?;
    let check = SafetyCheck::evaluate(&target);
    if !check.is_allowed() {
        anyhow::bail!("refusing to scan {device_id}: {:?}", check.reasons);
    }

    let gateway = PlatformGateway;
    let layout = scan_disk(&gateway, &target.id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&layout)?);
    } else {
        println!("{}", layout.summary());
    }
    Ok(())
}

async fn run_plan(device_id: &str, target_bytes: u64, options: MigrationOptions, end_reserve_mib: u64) -> anyhow::Result<()> {
    let manager = PlatformDeviceManager;
    let target = find_device(&manager, device_id).await?;
    let gateway = PlatformGateway;
    let source = scan_disk(&gateway, &target.id).await?;
    let planned = plan_layout(&source, target_bytes, &options, PlanMode::Migrate, end_reserve_mib)?;
    println!("{}", planned.summary());
    Ok(())
}

async fn run_migrate(
    source_device: &str,
    target_device: &str,
    target_bytes: u64,
    source_mount: &PathBuf,
    config: &ToolConfig,
) -> anyhow::Result<()> {
    let manager = PlatformDeviceManager;
    let source = find_device(&manager, source_device).await?;
    let target = find_device(&manager, target_device).await?;
    for (label, device) in [("source", &source), ("target", &target)] {
        let check = SafetyCheck::evaluate(device);
        if !check.is_allowed() {
            anyhow::bail!("refusing to touch {label} device {}: {:?}", device.id, check.reasons);
        }
    }

    let gateway: Arc<dyn sdtool_core::BlockDeviceGateway> = Arc::new(PlatformGateway);
    let source_layout = scan_disk(gateway.as_ref(), &source.id).await?;
    let target_layout = plan_layout(
        &source_layout,
        target_bytes,
        &MigrationOptions::default(),
        PlanMode::Migrate,
        config.end_reserve_mib,
    )?;

    let refresher = CommandTableRefresher;
    let formatter = CommandFat32Formatter;
    let tree_copier = CommandTreeCopier;
    let cancel = Arc::new(AtomicBool::new(false));
    let progress = Arc::new(FnProgress::new(|stage: &str, percent: u8, detail: &str| {
        println!("[{percent:>3}%] {stage}: {detail}");
    }));

    let engine = MigrationEngine {
        gateway,
        table_refresher: &refresher,
        formatter: &formatter,
        tree_copier: &tree_copier,
        progress,
        cancel,
    };
    let plan = MigrationPlan {
        source: source_layout,
        target: target_layout,
        source_device: source.id.clone(),
        source_fat32_mount: source_mount.clone(),
    };
    engine.run(&target.id, &plan).await?;
    Ok(())
}

async fn run_cleanup(
    device_id: &str,
    target_bytes: u64,
    source_mount: &PathBuf,
    backup_dir: &PathBuf,
    config: &ToolConfig,
) -> anyhow::Result<()> {
    let manager = PlatformDeviceManager;
    let device = find_device(&manager, device_id).await?;
    let check = SafetyCheck::evaluate(&device);
    if !check.is_allowed() {
        anyhow::bail!("refusing to clean up {device_id}: {:?}", check.reasons);
    }

    let gateway: Arc<dyn sdtool_core::BlockDeviceGateway> = Arc::new(PlatformGateway);
    let source_layout = scan_disk(gateway.as_ref(), &device.id).await?;
    let target_layout = plan_layout(
        &source_layout,
        target_bytes,
        &MigrationOptions::default(),
        PlanMode::Cleanup,
        config.end_reserve_mib,
    )?;

    let refresher = CommandTableRefresher;
    let formatter = CommandFat32Formatter;
    let tree_copier = CommandTreeCopier;
    let cancel = Arc::new(AtomicBool::new(false));
    let progress = Arc::new(FnProgress::new(|stage: &str, percent: u8, detail: &str| {
        println!("[{percent:>3}%] {stage}: {detail}");
    }));

    let cleanup = cleanup_engine(gateway, &refresher, &formatter, &tree_copier, progress, cancel, backup_dir.clone());
    cleanup.run(&device.id, source_layout, target_layout, source_mount).await?;
    Ok(())
}
