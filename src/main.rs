use clap::{Parser, Subcommand};
use tracing::{error, info};

use llamakeep::catalog::Catalog;
use llamakeep::compat;
use llamakeep::config::Config;
use llamakeep::download::DownloadOrchestrator;
use llamakeep::error::{KeepError, Result};
use llamakeep::events::{self, Event};
use llamakeep::inventory::InventoryTracker;
use llamakeep::server::{ControlPlaneClient, EngineState, ProcessSupervisor};

#[derive(Parser)]
#[command(name = "llamakeep")]
#[command(about = "Single-host manager for local inference models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List catalog models with installed/compatible markers
    List,
    /// Download a model, resuming any earlier partial transfer
    Download { id: String },
    /// Remove partial download data for a model
    Cancel { id: String },
    /// Delete a model's local files
    Delete { id: String },
    /// Run the engine supervisor in the foreground
    Start,
    /// Stop a running supervisor
    Stop,
    /// Stop any running supervisor, then run one in the foreground
    Restart,
    /// Ask the running engine to load a model
    Load { id: String },
    /// Ask the running engine to release a model
    Unload { id: String },
    /// Show engine and model status
    Status,
    /// Show the usable context window for a model on this host
    Context {
        id: String,
        /// Desired context in tokens; defaults to the model maximum
        #[arg(long)]
        desired: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::List => cmd_list(&config),
        Commands::Download { id } => cmd_download(&config, &id).await,
        Commands::Cancel { id } => cmd_cancel(&config, &id),
        Commands::Delete { id } => cmd_delete(&config, &id).await,
        Commands::Start => cmd_start(&config).await,
        Commands::Stop => cmd_stop(&config),
        Commands::Restart => {
            let _ = cmd_stop(&config);
            cmd_start(&config).await
        }
        Commands::Load { id } => cmd_load(&config, &id, true).await,
        Commands::Unload { id } => cmd_load(&config, &id, false).await,
        Commands::Status => cmd_status(&config).await,
        Commands::Context { id, desired } => cmd_context(&config, &id, desired),
    }
}

fn load_catalog(config: &Config) -> Result<Catalog> {
    Catalog::load(&config.storage.catalog_path()?)
}

fn cmd_list(config: &Config) -> Result<()> {
    let catalog = load_catalog(config)?;
    let models_dir = config.storage.models_dir()?;
    let host_mb = compat::host_memory_mb();

    println!("host memory: {host_mb} MB (budget {} MB)\n", compat::memory_budget_mb(host_mb));
    for v in catalog.variants() {
        let installed = if v.is_installed(&models_dir) { "*" } else { " " };
        let fit = if compat::is_compatible(v, host_mb) {
            "ok".to_string()
        } else {
            compat::check(v, host_mb, compat::MIN_CONTEXT_TOKENS).to_string()
        };
        println!(
            "{installed} {:40} {:>8.1} GB  {:8}  {fit}",
            v.id,
            v.file_size_mb() / 1024.0,
            v.quantization,
        );
    }
    println!("\n* installed");
    Ok(())
}

async fn cmd_download(config: &Config, id: &str) -> Result<()> {
    let catalog = load_catalog(config)?;
    let variant = catalog.get(id)?;
    let models_dir = config.storage.models_dir()?;
    let host_mb = compat::host_memory_mb();

    let (events, mut rx) = events::channel();
    let downloads =
        DownloadOrchestrator::new(models_dir, host_mb, events, &config.download)?;
    downloads.enqueue(variant)?;

    let bar = indicatif::ProgressBar::new(variant.file_size_bytes);
    bar.set_style(
        indicatif::ProgressStyle::with_template(
            "{msg} [{bar:40}] {bytes}/{total_bytes} ({eta})",
        )
        .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar()),
    );
    bar.set_message(variant.id.clone());

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(Event::DownloadProgress { model, completed, total }) if model == id => {
                    bar.set_length(total);
                    bar.set_position(completed);
                }
                Ok(Event::DownloadCompleted { model }) if model == id => {
                    bar.finish_with_message(format!("{id} installed"));
                    return Ok(());
                }
                Ok(Event::DownloadFailed { model, reason }) if model == id => {
                    bar.abandon();
                    return Err(KeepError::Network {
                        url: variant.main_url.clone(),
                        reason,
                    });
                }
                Ok(_) => {}
                Err(_) => {}
            },
            _ = tokio::signal::ctrl_c() => {
                downloads.cancel(id, false)?;
                bar.abandon_with_message("cancelled; partial data kept for resume");
                return Ok(());
            }
        }
    }
}

fn cmd_cancel(config: &Config, id: &str) -> Result<()> {
    let catalog = load_catalog(config)?;
    let variant = catalog.get(id)?;
    let models_dir = config.storage.models_dir()?;

    let mut removed = 0;
    for source in variant.sources() {
        let temp = source.temp_path(&models_dir);
        if temp.exists() {
            std::fs::remove_file(&temp)?;
            removed += 1;
        }
    }
    if removed == 0 {
        println!("no partial download data for {id}");
    } else {
        println!("removed {removed} partial file(s) for {id}");
    }
    Ok(())
}

async fn cmd_delete(config: &Config, id: &str) -> Result<()> {
    let catalog = load_catalog(config)?;
    let variant = catalog.get(id)?.clone();
    let models_dir = config.storage.models_dir()?;
    let host_mb = compat::host_memory_mb();

    let (events, _rx) = events::channel();
    let downloads = DownloadOrchestrator::new(
        models_dir.clone(),
        host_mb,
        events.clone(),
        &config.download,
    )?;
    let supervisor = ProcessSupervisor::new(
        config.engine.clone(),
        catalog,
        models_dir.clone(),
        host_mb,
        events.clone(),
    )?;
    let inventory = InventoryTracker::new(models_dir, events);

    inventory.delete(&variant, &supervisor, &downloads).await?;
    println!("deleted {id}");
    Ok(())
}

async fn cmd_start(config: &Config) -> Result<()> {
    let catalog = load_catalog(config)?;
    let models_dir = config.storage.models_dir()?;
    let host_mb = compat::host_memory_mb();

    let (events, mut rx) = events::channel();
    let supervisor = ProcessSupervisor::new(
        config.engine.clone(),
        catalog,
        models_dir.clone(),
        host_mb,
        events,
    )?;
    supervisor.start().await?;

    // Wait for the readiness verdict before claiming success.
    loop {
        match rx.recv().await {
            Ok(Event::EngineStateChanged(EngineState::Running)) => break,
            Ok(Event::EngineStateChanged(EngineState::Errored(fault))) => {
                return Err(KeepError::Launch(fault.to_string()));
            }
            Ok(_) => {}
            Err(_) => return Err(KeepError::Launch("event channel closed".to_string())),
        }
    }

    let pidfile = models_dir.join("llamakeep.pid");
    std::fs::write(&pidfile, std::process::id().to_string())?;
    info!("engine running on port {}; Ctrl-C to stop", config.engine.port);

    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }

    info!("shutting down");
    supervisor.stop().await?;
    let _ = std::fs::remove_file(&pidfile);
    Ok(())
}

fn cmd_stop(config: &Config) -> Result<()> {
    let pidfile = config.storage.models_dir()?.join("llamakeep.pid");
    let pid: i32 = std::fs::read_to_string(&pidfile)
        .map_err(|_| KeepError::NotFound("no running supervisor (pid file missing)".to_string()))?
        .trim()
        .parse()
        .map_err(|_| KeepError::Config(format!("corrupt pid file {}", pidfile.display())))?;

    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGTERM)
        .map_err(|e| KeepError::Launch(format!("cannot signal pid {pid}: {e}")))?;
    println!("stop requested (pid {pid})");
    Ok(())
}

async fn cmd_load(config: &Config, id: &str, load: bool) -> Result<()> {
    let catalog = load_catalog(config)?;
    catalog.get(id)?;

    let control = ControlPlaneClient::new(config.engine.port)?;
    if !control.health().await {
        return Err(KeepError::ControlPlane(
            "engine is not running; run `llamakeep start` first".to_string(),
        ));
    }
    if load {
        control.load(id).await?;
        println!("load of {id} requested");
    } else {
        control.unload(id).await?;
        println!("unload of {id} requested");
    }
    Ok(())
}

async fn cmd_status(config: &Config) -> Result<()> {
    let control = ControlPlaneClient::new(config.engine.port)?;
    if !control.health().await {
        println!("engine: idle");
        return Ok(());
    }
    println!("engine: running (port {})", config.engine.port);
    match control.models().await {
        Ok(models) if models.is_empty() => println!("no models reported"),
        Ok(models) => {
            for (id, status) in models {
                println!("  {id:40} {status}");
            }
        }
        Err(e) => error!("cannot query models: {e}"),
    }
    Ok(())
}

fn cmd_context(config: &Config, id: &str, desired: Option<u32>) -> Result<()> {
    let catalog = load_catalog(config)?;
    let variant = catalog.get(id)?;
    let host_mb = compat::host_memory_mb();
    let desired = desired.unwrap_or(variant.max_context);

    println!("host memory:   {host_mb} MB");
    println!("memory budget: {} MB", compat::memory_budget_mb(host_mb));
    match compat::usable_context_window(variant, host_mb, desired) {
        Some(ctx) => {
            println!("usable context: {ctx} tokens");
            println!(
                "estimated footprint: {} MB",
                compat::runtime_memory_mb(variant, ctx)
            );
        }
        None => {
            let verdict = compat::check(variant, host_mb, compat::MIN_CONTEXT_TOKENS);
            println!("not usable on this host: {verdict}");
        }
    }
    Ok(())
}
