use anyhow::Context;
use clap::{Parser, Subcommand};
use partwise_core::test_utils::{MemoryAuditSink, SimulatedEnvironment};
use partwise_core::{
    create_reallocation_plan, format_bytes, validate_resize, AuditReporter, DiskSnapshot,
    EngineConfig, EngineNotice, ExecuteOptions, PartitionToolkit, ResizeEngine, SnapshotProvider,
    StepActionType, TransactionStatus,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "partwise")]
#[command(about = "Partition resize planning and orchestration", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the partition layout from a snapshot file
    Inspect {
        /// Disk snapshot (JSON)
        snapshot: PathBuf,
    },
    /// Preview a space reallocation plan for growing a partition
    Plan {
        /// Disk snapshot (JSON)
        snapshot: PathBuf,
        /// Partition that needs more space
        #[arg(short, long)]
        target: String,
        /// Additional space to free, in bytes
        #[arg(short, long)]
        additional: u64,
    },
    /// Validate a resize request against the snapshot
    Validate {
        /// Disk snapshot (JSON)
        snapshot: PathBuf,
        /// Partition to resize
        #[arg(short, long)]
        partition: String,
        /// Target size in bytes
        #[arg(short, long)]
        size: u64,
        /// Acknowledge the risk of touching a system/boot/EFI partition
        #[arg(long)]
        override_protected: bool,
    },
    /// Run a full resize transaction against the simulated toolkit
    Simulate {
        /// Disk snapshot (JSON)
        snapshot: PathBuf,
        /// Partition to resize
        #[arg(short, long)]
        partition: String,
        /// Target size in bytes
        #[arg(short, long)]
        size: u64,
        /// Acknowledge that data at risk has been backed up
        #[arg(long)]
        ack_backup: bool,
        /// Acknowledge the risk of touching a system/boot/EFI partition
        #[arg(long)]
        override_protected: bool,
    },
}

fn load_snapshot(path: &Path) -> anyhow::Result<DiskSnapshot> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading snapshot {}", path.display()))?;
    let disk: DiskSnapshot =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    disk.validate()?;
    Ok(disk)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect { snapshot } => {
            let disk = load_snapshot(&snapshot)?;
            println!("Disk: {} ({})", disk.model, disk.device_path);
            println!("  Size: {}", format_bytes(disk.total_size));
            println!("  Alignment: {} bytes\n", disk.alignment_unit);
            for p in &disk.partitions {
                println!("Partition: {} ({})", p.device_path, p.display_label());
                println!("  Id: {}", p.id);
                println!(
                    "  Extent: {} .. {}",
                    format_bytes(p.start_offset),
                    format_bytes(p.end_offset())
                );
                println!("  Size: {}", format_bytes(p.total_size));
                if let Some(used) = p.used_space {
                    println!("  Used: {}", format_bytes(used));
                }
                println!("  Filesystem: {}", p.filesystem.display_name());
                println!(
                    "  Protected: {}",
                    if p.is_protected() { "Yes" } else { "No" }
                );
                if p.is_mounted {
                    println!("  Mounted at: {}", p.mount_point.as_deref().unwrap_or("?"));
                }
                println!();
            }
        }
        Commands::Plan {
            snapshot,
            target,
            additional,
        } => {
            let disk = load_snapshot(&snapshot)?;
            let plan = create_reallocation_plan(&disk, &target, additional)?;

            println!(
                "Plan: free {} for {} (new size {})\n",
                format_bytes(plan.total_space_freed),
                plan.target_partition_id,
                format_bytes(plan.target_new_size)
            );
            for warning in &plan.warnings {
                println!("WARNING: {}", warning);
            }
            if !plan.warnings.is_empty() {
                println!();
            }
            for step in &plan.steps {
                let kind = match step.action_type {
                    StepActionType::UserManual => "manual",
                    StepActionType::AppAssistedManual => "assisted",
                    StepActionType::AppAutomated => "automated",
                };
                println!("{}. [{}] {}", step.step_number, kind, step.title);
                println!("   {}", step.description);
            }
        }
        Commands::Validate {
            snapshot,
            partition,
            size,
            override_protected,
        } => {
            let disk = load_snapshot(&snapshot)?;
            match validate_resize(
                &disk,
                &partition,
                size,
                override_protected,
                &EngineConfig::default(),
            ) {
                Ok(op) => {
                    println!(
                        "OK: {} {:?} from {} to {} (safe size {})",
                        op.partition.device_path,
                        op.direction,
                        format_bytes(op.current_size()),
                        format_bytes(op.requested_size),
                        format_bytes(op.safe_size)
                    );
                    for check in &op.preflight {
                        println!("  {:<16} {}", check.name, check.detail);
                    }
                }
                Err(e) => {
                    println!("Validation failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Simulate {
            snapshot,
            partition,
            size,
            ack_backup,
            override_protected,
        } => {
            let disk = load_snapshot(&snapshot)?;
            let config = EngineConfig::default();
            let op = validate_resize(&disk, &partition, size, override_protected, &config)?;

            let env = Arc::new(SimulatedEnvironment::new(disk));
            let toolkit: Arc<dyn PartitionToolkit> = env.clone();
            let provider: Arc<dyn SnapshotProvider> = env.clone();
            let engine = ResizeEngine::new(config, toolkit, provider);

            let sink = Arc::new(MemoryAuditSink::new());
            let mut reporter = AuditReporter::new(sink.clone());
            let mut notices = engine.subscribe();
            let printer = tokio::spawn(async move {
                while let Ok(notice) = notices.recv().await {
                    if let EngineNotice::Phase(event) = &notice {
                        println!(
                            "[{:>5.1}%] {:<24} {}",
                            event.percent,
                            event.phase.display_name(),
                            event.message
                        );
                    }
                    let finished = matches!(notice, EngineNotice::Finished { .. });
                    reporter.handle(notice).await;
                    if finished {
                        break;
                    }
                }
            });

            let outcome = engine
                .execute(
                    op,
                    ExecuteOptions {
                        backup_acknowledged: ack_backup,
                        cancel: None,
                    },
                )
                .await?;
            printer.await?;

            println!("\nOutcome: {:?}", outcome.status);
            for record in sink.records() {
                println!("{}", serde_json::to_string_pretty(&record)?);
            }
            if outcome.status != TransactionStatus::Committed {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
