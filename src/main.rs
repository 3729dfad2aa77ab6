use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use winboot::config::AppConfig;
use winboot::context::AppContext;
use winboot::core::{CreationProgress, ImageInfo, RemovableDrive};
use winboot::logging::{self, LogConfig};
use winboot::parsers::diskutil::device_path;

#[derive(Parser)]
#[command(name = "winboot")]
#[command(about = "Create bootable Windows installer USB drives", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./winboot.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,
}

/// Command-line values layered over the configuration file and environment.
#[derive(Args, Serialize)]
struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    json_logs: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    volume_label: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    split_size_mb: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// List external drives
    List {
        #[arg(long)]
        json: bool,
    },
    /// Validate and mount an image, report its payload, then unmount it
    Inspect { image: PathBuf },
    /// Erase a drive and write a Windows installer to it
    Create(CreateArgs),
    /// Eject a drive
    Eject { drive: String },
    /// Check that the external tools are installed
    Doctor,
    /// Print the effective configuration
    Config,
}

#[derive(Args)]
struct CreateArgs {
    /// Windows installation image (.iso)
    #[arg(long)]
    image: PathBuf,

    /// Target drive, e.g. disk4 or /dev/disk4
    #[arg(long)]
    drive: String,

    /// Skip the confirmation prompt
    #[arg(long)]
    yes: bool,

    /// Eject the drive when done
    #[arg(long)]
    eject: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::new(cli.config.as_deref(), Some(&cli.overrides))?;
    logging::init(LogConfig::from(&config));

    let ctx = AppContext::new(config);

    match cli.command {
        Commands::List { json } => run_list(&ctx, json).await.context("Failed to list drives")?,
        Commands::Inspect { image } => run_inspect(&ctx, &image)
            .await
            .context("Failed to inspect image")?,
        Commands::Create(args) => run_create(&ctx, args).await?,
        Commands::Eject { drive } => ctx
            .devices
            .eject(&drive)
            .await
            .context("Failed to eject drive")?,
        Commands::Doctor => run_doctor(&ctx).await?,
        Commands::Config => print!("{}", ctx.config.to_toml()?),
    }

    Ok(())
}

async fn run_list(ctx: &AppContext, json: bool) -> Result<()> {
    let drives = ctx.devices.list().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&drives)?);
        return Ok(());
    }

    if drives.is_empty() {
        println!("No external drives found.");
        return Ok(());
    }

    for drive in &drives {
        let note = if drive.is_valid_for_windows() {
            ""
        } else {
            "  (too small)"
        };
        println!("{:<12} {:>10}  {}{}", drive.device_node, drive.size_formatted(), drive.name, note);
    }
    Ok(())
}

async fn run_inspect(ctx: &AppContext, path: &Path) -> Result<()> {
    let image = ctx.images.mount(path).await;
    if let Ok(image) = &image {
        print_image(ctx, image).await;
    }

    ctx.images.unmount_all().await;
    image?;
    Ok(())
}

async fn print_image(ctx: &AppContext, image: &ImageInfo) {
    println!("Image:    {} ({})", image.name, image.size_formatted());
    if let Some(mount) = &image.mount_point {
        println!("Mounted:  {}", mount.display());
    }

    let Some(payload) = &image.payload_path else {
        println!("Payload:  none (boot files only)");
        return;
    };
    println!("Payload:  {} ({})", payload.display(), image.payload_size_formatted());
    println!(
        "Split:    {}",
        if image.needs_wim_split() { "required" } else { "not needed" }
    );

    if payload.extension().is_some_and(|e| e == "wim") {
        match ctx.splitter.info(payload).await {
            Ok(info) => println!("Images:   {} ({})", info.image_count, info.size_formatted()),
            Err(e) => println!("Images:   unknown ({})", e),
        }
    }
}

async fn run_create(ctx: &AppContext, args: CreateArgs) -> Result<()> {
    let orchestrator = &ctx.orchestrator;

    ctx.dependencies
        .require_all()
        .await
        .context("Required tools are missing, run `winboot doctor` for details")?;

    orchestrator.select_image(&args.image).await?;

    let device = device_path(&args.drive);
    let drives = orchestrator.refresh_drives().await?;
    let drive = drives
        .into_iter()
        .find(|d| d.device_node == device)
        .with_context(|| format!("{} is not an attached external drive", device))?;
    orchestrator.select_drive(drive.clone())?;

    if !args.yes && !confirm_erase(&drive)? {
        println!("Aborted.");
        return Ok(());
    }

    let progress = tokio::spawn(render_progress(orchestrator.subscribe()));

    let runner = orchestrator.clone();
    let mut run = tokio::spawn(async move { runner.start().await });

    let joined = tokio::select! {
        joined = &mut run => joined,
        _ = tokio::signal::ctrl_c() => {
            eprintln!();
            eprintln!("Cancelling, waiting for the current step to finish...");
            orchestrator.cancel();
            run.await
        }
    };
    progress.abort();
    println!();

    joined.context("Creation task panicked")??;
    println!("Complete! {} is ready.", drive.display_name());

    if args.eject {
        orchestrator.eject().await.context("Failed to eject drive")?;
        println!("Ejected {}.", drive.device_node);
    }
    Ok(())
}

fn confirm_erase(drive: &RemovableDrive) -> Result<bool> {
    println!(
        "All data on {} ({}) will be erased.",
        drive.display_name(),
        drive.device_node
    );
    print!("Type 'yes' to continue: ");
    std::io::stdout().flush()?;

    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("yes"))
}

async fn render_progress(mut rx: watch::Receiver<CreationProgress>) {
    let mut last_stage = None;
    let mut last_line = String::new();

    while rx.changed().await.is_ok() {
        let progress = rx.borrow_and_update().clone();

        if last_stage != Some(progress.stage) {
            if last_stage.is_some() {
                println!();
            }
            println!("{}", progress.stage);
            last_stage = Some(progress.stage);
        }

        let mut line = format!("  [{:>3.0}%]", progress.overall_progress * 100.0);
        if progress.total_bytes > 0 {
            line.push_str(&format!(
                " {} / {}",
                progress.bytes_transferred_formatted(),
                progress.total_bytes_formatted()
            ));
        }
        if !progress.current_file.is_empty() {
            line.push_str(&format!("  {}", progress.current_file));
        }

        if line != last_line {
            print!("\r\x1b[2K{}", line);
            let _ = std::io::stdout().flush();
            last_line = line;
        }

        if let Some(error) = &progress.error {
            println!();
            eprintln!("Error: {}", error);
        }
        if progress.stage.is_terminal() {
            break;
        }
    }
}

async fn run_doctor(ctx: &AppContext) -> Result<()> {
    let statuses = ctx.dependencies.check_all().await;
    for status in &statuses {
        match &status.location {
            Some(location) => println!("ok       {:<10} {}", status.name, location),
            None => println!("missing  {:<10} {}", status.name, status.program),
        }
    }

    if statuses.iter().any(|s| !s.is_installed()) {
        bail!("Some required tools are missing");
    }
    Ok(())
}
