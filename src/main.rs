use anyhow::{bail, Context, Result};
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use memora::caption::{CaptionClient, CaptionProvider};
use memora::config::Config;
use memora::db::SqliteStore;
use memora::logging;
use memora::pipeline::{ImageStatus, Pipeline, PipelineOptions, RunContext, Trigger};
use memora::scanner::FsAssetSource;
use memora::schedule::{Environment, EnvironmentProbe, SysfsProbe};
use memora::settings::format_clock;
use memora::tasks::{BackgroundTaskManager, TaskType, TaskUpdate};

enum Command {
    Import(Vec<PathBuf>),
    Scan,
    Process { scan: bool },
    List,
    Status,
    Show(String),
    Reprocess { id: String, enqueue: bool },
    Delete(String),
    Detail(String),
    Settings(Option<(String, String)>),
    Check,
}

struct Cli {
    command: Command,
    config_path: Option<PathBuf>,
    wifi: Option<bool>,
    charging: Option<bool>,
}

fn usage_error(message: &str) -> ! {
    eprintln!("Error: {}", message);
    print_help();
    std::process::exit(1);
}

fn parse_args() -> Cli {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config_path = None;
    let mut wifi = None;
    let mut charging = None;
    let mut positional = Vec::new();
    let mut flag_scan = false;
    let mut flag_enqueue = false;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("memora {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    usage_error("--config requires a path argument");
                }
            }
            "--wifi" => wifi = Some(true),
            "--no-wifi" => wifi = Some(false),
            "--charging" => charging = Some(true),
            "--no-charging" => charging = Some(false),
            "--scan" => flag_scan = true,
            "--enqueue" => flag_enqueue = true,
            arg if arg.starts_with('-') => usage_error(&format!("Unknown argument: {}", arg)),
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let mut positional = positional.into_iter();
    let name = positional.next().unwrap_or_else(|| "status".to_string());
    let rest: Vec<String> = positional.collect();
    let single = |what: &str| -> String {
        match rest.as_slice() {
            [id] => id.clone(),
            _ => usage_error(&format!("{} takes exactly one image id", what)),
        }
    };

    let command = match name.as_str() {
        "import" => {
            if rest.is_empty() {
                usage_error("import requires at least one path");
            }
            Command::Import(rest.iter().map(PathBuf::from).collect())
        }
        "scan" => Command::Scan,
        "process" => Command::Process { scan: flag_scan },
        "list" => Command::List,
        "status" => Command::Status,
        "show" => Command::Show(single("show")),
        "reprocess" => Command::Reprocess {
            id: single("reprocess"),
            enqueue: flag_enqueue,
        },
        "delete" => Command::Delete(single("delete")),
        "detail" => Command::Detail(single("detail")),
        "settings" => match rest.as_slice() {
            [] => Command::Settings(None),
            [key, value] => Command::Settings(Some((key.clone(), value.clone()))),
            _ => usage_error("settings takes no arguments or KEY VALUE"),
        },
        "check" => Command::Check,
        other => usage_error(&format!("Unknown command: {}", other)),
    };

    Cli {
        command,
        config_path,
        wifi,
        charging,
    }
}

fn print_help() {
    println!(
        r#"memora - accessibility captions for your photo library

USAGE:
    memora [OPTIONS] [COMMAND]

COMMANDS:
    import PATH...          Add images and queue them for captioning
    scan                    Look for new images in the library directories
    process [--scan]        Caption everything in the queue (optionally scan first)
    list                    List known images
    status                  Show queue and library summary (default)
    show ID                 Show one image in full
    reprocess ID [--enqueue]
                            Reset an image; --enqueue also queues it
    delete ID               Forget an image
    detail ID               Generate the detailed caption for a processed image
    settings [KEY VALUE]    Show settings, or change one
    check                   Test the captioning provider connection

SETTINGS KEYS:
    auto_scan BOOL          Allow periodic background scans
    frequency VALUE         daily, weekly, or a number of days
    wifi_only BOOL          Only run when on wifi
    charging_only BOOL      Only run while charging
    window HH:MM-HH:MM|off  Restrict background work to a time of day
    auto_process BOOL       Queue new images automatically
    detailed BOOL           Also generate detailed captions

OPTIONS:
    --config, -c PATH       Path to config file
    --wifi, --no-wifi       Override detected network state
    --charging, --no-charging
                            Override detected power state
    --version, -V           Show version
    --help, -h              Show this help message

ENVIRONMENT:
    MEMORA_CONFIG           Path to config file (overrides default location)
    MEMORA_API_KEY          Provider API key when not set in the config file
    MEMORA_LOG              Log level (trace, debug, info, warn, error)

See also: memora-daemon --help"#
    );
}

fn open_pipeline(config: &Config) -> Result<(Arc<Pipeline>, CaptionClient)> {
    let store = SqliteStore::open(&config.db_path)?;
    let client = CaptionClient::from_config(&config.provider);
    let source = FsAssetSource::new(
        config.library.roots.clone(),
        config.library.image_extensions.clone(),
    );

    let pipeline = Pipeline::open(
        Arc::new(store),
        client.provider(),
        Arc::new(source),
        PipelineOptions::from_config(config),
    )
    .context("Failed to load pipeline state")?;

    Ok((Arc::new(pipeline), client))
}

fn detect_environment(cli: &Cli) -> Environment {
    let detected = SysfsProbe::new().probe();
    Environment {
        on_wifi: cli.wifi.unwrap_or(detected.on_wifi),
        charging: cli.charging.unwrap_or(detected.charging),
    }
}

fn status_line(record: &memora::ImageRecord) -> String {
    let detail = match record.status {
        ImageStatus::Processed => record.caption.clone().unwrap_or_default(),
        ImageStatus::Error => format!("error: {}", record.error.as_deref().unwrap_or("unknown")),
        ImageStatus::Processing => "captioning...".to_string(),
        ImageStatus::Unprocessed => String::new(),
    };
    format!("{} {}  {:<24} {}", record.status.short_name(), record.id, record.file_name, detail)
}

/// Run `work` on a worker thread registered with the task manager, printing
/// progress until it reports a terminal update.
/// Deliver Ctrl-C presses on a channel. A second press, or one arriving
/// after the receiver is gone, exits at once.
fn interrupt_channel() -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::warn!(error = %e, "Ctrl-C handling unavailable");
                return;
            }
        };
        runtime.block_on(async move {
            let mut presses = 0u32;
            while tokio::signal::ctrl_c().await.is_ok() {
                presses += 1;
                if presses > 1 || tx.send(()).is_err() {
                    std::process::exit(130);
                }
            }
        });
    });
    rx
}

/// Run `work` on a worker thread, printing progress until it finishes.
/// Ctrl-C asks the work to stop after the current item.
fn run_task<F>(task_type: TaskType, work: F) -> Result<String>
where
    F: FnOnce(mpsc::Sender<TaskUpdate>, Arc<AtomicBool>) -> TaskUpdate + Send + 'static,
{
    let mut manager = BackgroundTaskManager::new();
    let (id, tx, cancel) = manager.register_task(task_type);
    let interrupts = interrupt_channel();

    let worker = thread::spawn(move || {
        let update = work(tx.clone(), cancel);
        let _ = tx.send(update);
    });

    let mut last_item = None;
    loop {
        if interrupts.try_recv().is_ok() && manager.cancel_task(id) {
            println!("Stopping after the current step (Ctrl-C again to quit)");
        }
        if let Some(info) = manager.poll_updates().into_iter().next() {
            let _ = worker.join();
            tracing::debug!(
                task = info.task_type.display_name(),
                elapsed_ms = info.elapsed.as_millis() as u64,
                "Task finished"
            );
            if info.succeeded() {
                return Ok(info.message);
            }
            bail!("{}: {}", info.task_type.display_name(), info.message);
        }
        if let Some(task) = manager.running_tasks().first() {
            if let Some(ref progress) = task.progress {
                if progress.current_item != last_item {
                    if let Some(ref item) = progress.current_item {
                        println!(
                            "[{}/{} {:>3}%] {}",
                            progress.current,
                            progress.total,
                            progress.percent(),
                            item
                        );
                    }
                    last_item = progress.current_item.clone();
                }
            }
        }
        thread::sleep(Duration::from_millis(100));
    }
}

fn run_process(pipeline: Arc<Pipeline>, environment: Environment, scan: bool) -> Result<String> {
    run_task(TaskType::CaptionBatch, move |tx, cancel| {
        let ctx = RunContext::new(Trigger::Foreground { scan }, environment)
            .with_cancel(cancel)
            .with_progress(tx);
        match pipeline.run(&ctx, &Local::now()) {
            Ok(report) if report.gated => TaskUpdate::Failed {
                error: "Network or power requirements not met (see wifi_only / charging_only)"
                    .to_string(),
            },
            Ok(report) if report.drain.cancelled => TaskUpdate::Cancelled,
            Ok(report) => TaskUpdate::Completed {
                message: format!(
                    "{} new, {} captioned, {} failed, {} still queued",
                    report.discovered,
                    report.drain.processed,
                    report.drain.failed,
                    report.drain.remaining
                ),
            },
            Err(e) => TaskUpdate::Failed { error: e.to_string() },
        }
    })
}

fn print_settings(pipeline: &Pipeline) {
    let settings = pipeline.settings();
    let scan = &settings.scan;
    let window = if scan.time_window.enabled {
        format!(
            "{}-{}",
            format_clock(scan.time_window.start_minute),
            format_clock(scan.time_window.end_minute)
        )
    } else {
        "off".to_string()
    };
    println!("auto_scan      {}", scan.auto_scan_enabled);
    println!("frequency      {}", scan.frequency);
    println!("wifi_only      {}", scan.wifi_only);
    println!("charging_only  {}", scan.charging_only);
    println!("window         {}", window);
    println!("auto_process   {}", settings.processing.auto_process_on_import);
    println!("detailed       {}", settings.processing.generate_detailed_caption);
}

fn resolve_import_path(path: &Path) -> Result<String> {
    let canonical = path
        .canonicalize()
        .with_context(|| format!("Cannot read {}", path.display()))?;
    if !canonical.is_file() {
        bail!("{} is not a file", path.display());
    }
    Ok(canonical.to_string_lossy().to_string())
}

fn main() -> Result<()> {
    let cli = parse_args();

    let _ = logging::init(Some(Config::config_dir().join("logs")));

    let config = match cli.config_path {
        Some(ref path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let (pipeline, client) = open_pipeline(&config)?;

    match cli.command {
        Command::Import(ref paths) => {
            for path in paths {
                let source_ref = resolve_import_path(path)?;
                let record = pipeline.import(&source_ref)?;
                println!("{}", status_line(&record));
            }
        }
        Command::Scan => {
            let scanner = Arc::clone(&pipeline);
            let message = run_task(TaskType::Scan, move |_tx, _cancel| match scanner.scan() {
                Ok(added) => {
                    for record in &added {
                        println!("{}", status_line(record));
                    }
                    TaskUpdate::Completed {
                        message: format!("{} new images", added.len()),
                    }
                }
                Err(e) => TaskUpdate::Failed { error: e.to_string() },
            })?;
            println!("{}", message);
        }
        Command::Process { scan } => {
            let environment = detect_environment(&cli);
            println!("{}", run_process(Arc::clone(&pipeline), environment, scan)?);
        }
        Command::List => {
            for record in pipeline.records() {
                println!("{}", status_line(&record));
            }
        }
        Command::Status => {
            let snapshot = pipeline.snapshot();
            let count = |status: ImageStatus| {
                snapshot.records.iter().filter(|r| r.status == status).count()
            };
            println!("images       {}", snapshot.records.len());
            println!("  processed  {}", count(ImageStatus::Processed));
            println!("  pending    {}", count(ImageStatus::Unprocessed));
            println!("  failed     {}", count(ImageStatus::Error));
            println!("queued       {}", snapshot.queue_len);
            println!(
                "last scan    {}",
                snapshot
                    .last_scan_at
                    .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string())
            );
            println!(
                "provider     {}{}",
                client.provider_name(),
                if pipeline.provider().is_configured() { "" } else { " (not configured)" }
            );
        }
        Command::Show(ref id) => {
            let record = pipeline
                .get(id)
                .ok_or_else(|| memora::PipelineError::NotFound(id.clone()))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Reprocess { ref id, enqueue } => {
            let record = pipeline.reprocess(id, enqueue)?;
            println!("{}", status_line(&record));
        }
        Command::Delete(ref id) => {
            let record = pipeline.delete(id)?;
            println!("Deleted {} ({})", record.id, record.file_name);
        }
        Command::Detail(ref id) => {
            let worker = Arc::clone(&pipeline);
            let id = id.clone();
            let text = run_task(TaskType::DetailedCaption, move |_tx, _cancel| {
                match worker.generate_detailed_caption(&id) {
                    Ok(text) => TaskUpdate::Completed { message: text },
                    Err(e) => TaskUpdate::Failed { error: e.to_string() },
                }
            })?;
            println!("{}", text);
        }
        Command::Settings(None) => print_settings(&pipeline),
        Command::Settings(Some((ref key, ref value))) => {
            pipeline.update_settings(|settings| settings.set(key, value))?;
            print_settings(&pipeline);
        }
        Command::Check => {
            if !client.is_configured() {
                bail!(
                    "{} is not configured; set provider.api_key or MEMORA_API_KEY",
                    client.provider_name()
                );
            }
            if client.test_connection() {
                println!("{}: connection OK", client.provider_name());
            } else {
                bail!("{}: connection failed", client.provider_name());
            }
        }
    }

    Ok(())
}
