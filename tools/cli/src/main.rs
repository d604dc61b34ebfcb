//! ClientSync CLI - keeps local snapshots of the remote client datasets.
//!
//! `run` starts the background sync and listing tasks and accepts commands
//! on stdin; the other subcommands are one-shot operations on the same
//! data directory.

mod files;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use clientsync_common::{read_config, ConfigSource, FileConfig};
use clientsync_remote::ApiClient;
use clientsync_sync::{
    load_contacts, scan_directory, Contact, CycleReport, CycleRunner, DeltaStore, FileListing,
    ListingHandle, ListingPublisher, SchedulerConfig, SyncConfig, SyncEngine, SyncScheduler,
};

const LOG_FILE: &str = "logs.log";

#[derive(Parser)]
#[command(name = "clientsync")]
#[command(about = "ClientSync - Background sync of remote client data")]
#[command(version)]
struct Cli {
    /// Directory holding db/, logs/ and config.json.
    #[arg(short, long, default_value = ".")]
    data_dir: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the background sync and listing tasks.
    Run,

    /// Run one sync cycle now.
    Sync,

    /// Manage snapshot files.
    Files {
        #[command(subcommand)]
        action: FilesAction,
    },

    /// Show or change the configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// List contacts from the local snapshots.
    Contacts,

    /// Check that the remote service is reachable.
    Ping,
}

#[derive(Subcommand)]
enum FilesAction {
    /// List snapshot files.
    List,

    /// Print a snapshot file.
    Show { name: String },

    /// Delete a snapshot file.
    Delete {
        name: String,

        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Create a new file and open it in the editor.
    Add { name: String },

    /// Open an existing file in the editor.
    Edit { name: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the current configuration.
    Show,

    /// Set the API base URL.
    SetUrl { url: String },

    /// Set the host checked by `ping`.
    SetPing { url: String },

    /// Set the sync interval in minutes.
    SetInterval { minutes: i64 },

    /// Set the login user; the password is prompted for.
    SetCredentials { username: String },
}

/// Locations inside the data directory.
struct DataPaths {
    db: PathBuf,
    logs: PathBuf,
    config: PathBuf,
}

impl DataPaths {
    fn new(data_dir: &Path) -> Self {
        Self {
            db: data_dir.join("db"),
            logs: data_dir.join("logs"),
            config: data_dir.join(clientsync_common::config::CONFIG_FILENAME),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let paths = DataPaths::new(&cli.data_dir);

    let _guard = init_logging(&paths.logs, cli.verbose)?;

    match cli.command {
        Commands::Run => cmd_run(&paths).await,
        Commands::Sync => cmd_sync(&paths).await,
        Commands::Files { action } => cmd_files(&paths, action).await,
        Commands::Config { action } => cmd_config(&paths, action).await,
        Commands::Contacts => cmd_contacts(&paths).await,
        Commands::Ping => cmd_ping(&paths).await,
    }
}

/// Send all events to `logs/logs.log`, appending; mirror to stderr when verbose.
fn init_logging(log_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
    let appender = open_log_appender(log_dir)?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false),
        )
        .with(verbose.then(|| {
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact()
        }))
        .try_init()
        .context("Failed to install log subscriber")?;

    Ok(guard)
}

/// Open the shared log file for appending. Earlier runs' lines are kept.
fn open_log_appender(log_dir: &Path) -> Result<RollingFileAppender> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(LOG_FILE)
        .build(log_dir)
        .context("Failed to open log file")
}

fn open_config(paths: &DataPaths) -> Result<Arc<FileConfig>> {
    let config = FileConfig::open(&paths.config).context("Failed to open configuration")?;
    // Creates the file with defaults on first use.
    config.load().context("Failed to load configuration")?;
    Ok(Arc::new(config))
}

fn build_engine(paths: &DataPaths, config: Arc<FileConfig>) -> Result<Arc<SyncEngine<ApiClient>>> {
    let client = ApiClient::new(config).context("Failed to create API client")?;
    Ok(Arc::new(SyncEngine::new(
        Arc::new(client),
        &paths.db,
        SyncConfig::default(),
    )))
}

fn print_report(report: &CycleReport) {
    println!("Sync finished in {:.1?}: {}", report.duration, report);
    for (kind, message) in &report.write_errors {
        println!("  write error for {}: {}", kind, message);
    }
}

fn print_contacts(contacts: &[Contact]) {
    if contacts.is_empty() {
        println!("No contacts to show. Run a sync first.");
        return;
    }
    println!("Contacts ({}):", contacts.len());
    for contact in contacts {
        println!("{}", contact);
        println!("{}", "-".repeat(20));
    }
}

fn print_listing(listing: &FileListing) {
    if listing.is_empty() {
        println!("No snapshot files.");
        return;
    }
    println!("Snapshot files ({}):", listing.len());
    for name in listing.iter() {
        println!("  {}", name);
    }
}

/// Start both periodic tasks and serve stdin commands until quit or Ctrl-C.
async fn cmd_run(paths: &DataPaths) -> Result<()> {
    let config = open_config(paths)?;
    let engine = build_engine(paths, config.clone())?;
    engine
        .prepare()
        .await
        .context("Failed to create snapshot directory")?;

    let (mut publisher, _) = ListingPublisher::new(&paths.db);
    let listing = publisher
        .refresh()
        .await
        .context("Failed to list snapshot directory")?;
    info!(files = listing.len(), "Starting background tasks");

    let scheduler = SyncScheduler::start(
        engine,
        config.clone(),
        publisher,
        SchedulerConfig::default(),
    );

    println!(
        "ClientSync running with {} snapshot file(s). Type 'help' for commands.",
        listing.len()
    );

    let mut stdin = StdinReader::spawn();
    stdin.request();
    let mut stdin_open = true;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Interrupted");
                break;
            }
            line = stdin.recv(), if stdin_open => match line {
                Some(line) => {
                    if !handle_command(&scheduler, paths, &config, &mut stdin, line.trim()).await {
                        break;
                    }
                    stdin.request();
                }
                None => {
                    info!("Stdin closed, running until interrupted");
                    stdin_open = false;
                }
            }
        }
    }

    scheduler.shutdown().await?;
    println!("Stopped.");
    Ok(())
}

/// Stdin lines read on a dedicated thread, one line per request.
///
/// A pending read cannot be cancelled, so the thread stays off the blocking
/// pool. It only reads when asked, which leaves the terminal to an editor
/// while a command runs.
struct StdinReader {
    permits: std::sync::mpsc::Sender<()>,
    lines: mpsc::Receiver<String>,
}

impl StdinReader {
    fn spawn() -> Self {
        let (permits, permit_rx) = std::sync::mpsc::channel::<()>();
        let (tx, lines) = mpsc::channel(1);

        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            while permit_rx.recv().is_ok() {
                let mut line = String::new();
                match stdin.lock().read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if tx.blocking_send(line.trim_end().to_string()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self { permits, lines }
    }

    /// Let the reader take the next line.
    fn request(&self) {
        let _ = self.permits.send(());
    }

    async fn recv(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Ask a yes/no question and wait for the answer.
    async fn confirm(&mut self, question: &str) -> bool {
        print!("{} (y/n): ", question);
        let _ = std::io::stdout().flush();
        self.request();
        self.recv()
            .await
            .map(|answer| files::is_yes(&answer))
            .unwrap_or(false)
    }
}

/// Run a blocking file change, then have the listing task publish the result.
async fn change_files<F>(listing: &ListingHandle, change: F) -> Result<FileListing>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(change).await??;
    listing
        .refresh_now()
        .await
        .context("Failed to refresh file listing")
}

fn print_change(result: Result<FileListing>, done: &str) {
    match result {
        Ok(listing) => println!("{} {} snapshot file(s) listed.", done, listing.len()),
        Err(e) => println!("Error: {:#}", e),
    }
}

/// Handle one interactive command. Returns `false` to quit.
async fn handle_command(
    scheduler: &SyncScheduler<SyncEngine<ApiClient>>,
    paths: &DataPaths,
    config: &Arc<FileConfig>,
    stdin: &mut StdinReader,
    line: &str,
) -> bool {
    let (command, arg) = match line.split_once(' ') {
        Some((command, arg)) => (command, arg.trim()),
        None => (line, ""),
    };
    let db = paths.db.clone();
    let name = arg.to_string();

    match command {
        "" => {}
        "sync" => match scheduler.trigger_now().await {
            Ok(report) => print_report(&report),
            Err(e) => println!("Sync failed: {}", e),
        },
        "list" | "files" => print_listing(&scheduler.listing().current()),
        "contacts" => match load_contacts(&DeltaStore::new(&paths.db)).await {
            Ok(contacts) => print_contacts(&contacts),
            Err(e) => println!("Cannot list contacts: {}", e),
        },
        "show" => match tokio::task::spawn_blocking(move || files::show(&db, &name)).await {
            Ok(Ok(content)) => println!("{}", content),
            Ok(Err(e)) => println!("Error: {:#}", e),
            Err(e) => println!("Error: {}", e),
        },
        "add" => {
            let editor = files::editor_command();
            let result =
                change_files(scheduler.listing(), move || files::add(&db, &name, &editor)).await;
            print_change(result, "File added.");
        }
        "edit" => {
            let editor = files::editor_command();
            let result =
                change_files(scheduler.listing(), move || files::edit(&db, &name, &editor)).await;
            print_change(result, "File saved.");
        }
        "delete" => {
            if let Err(e) = files::resolve(&db, &name) {
                println!("Error: {:#}", e);
            } else if stdin.confirm(&format!("Delete '{}'?", name)).await {
                let result =
                    change_files(scheduler.listing(), move || files::delete(&db, &name)).await;
                print_change(result, "File deleted.");
            } else {
                println!("Deletion cancelled.");
            }
        }
        "status" => {
            println!("sync task:    {:?}", scheduler.sync_state());
            println!("listing task: {:?}", scheduler.listing_state());
            let source: Arc<dyn ConfigSource> = config.clone();
            match read_config(&source, |c| c.sync_interval()).await {
                Ok(interval) => println!("interval:     {:?}", interval),
                Err(e) => println!("interval:     {}", e),
            }
        }
        "ping" => {
            if let Err(e) = ping(config.clone()).await {
                println!("{:#}", e);
            }
        }
        "help" => {
            println!("Commands:");
            println!("  sync           run a sync cycle now");
            println!("  list           list snapshot files");
            println!("  contacts       list contacts from the snapshots");
            println!("  show <name>    print a snapshot file");
            println!("  add <name>     create a file in the editor");
            println!("  edit <name>    edit a file in the editor");
            println!("  delete <name>  delete a file");
            println!("  status         show task states");
            println!("  ping           check the remote service");
            println!("  quit           stop and exit");
        }
        "quit" | "exit" => return false,
        other => println!("Unknown command '{}'. Type 'help' for commands.", other),
    }
    true
}

/// Run one cycle and print its report.
async fn cmd_sync(paths: &DataPaths) -> Result<()> {
    let config = open_config(paths)?;
    let engine = build_engine(paths, config)?;

    let report = engine.sync_once().await.context("Sync failed")?;
    print_report(&report);

    if !report.is_success() {
        anyhow::bail!("Sync did not complete");
    }
    let listing = scan_directory(&paths.db).await?;
    println!("{} snapshot file(s) on disk.", listing.len());
    Ok(())
}

async fn cmd_contacts(paths: &DataPaths) -> Result<()> {
    let contacts = load_contacts(&DeltaStore::new(&paths.db))
        .await
        .context("Cannot list contacts")?;
    print_contacts(&contacts);
    Ok(())
}

async fn cmd_files(paths: &DataPaths, action: FilesAction) -> Result<()> {
    let db = paths.db.clone();

    let changed = match action {
        FilesAction::List => {
            let listing = if db.exists() {
                scan_directory(&db).await?
            } else {
                FileListing::new()
            };
            print_listing(&listing);
            false
        }
        FilesAction::Show { name } => {
            let content = tokio::task::spawn_blocking(move || files::show(&db, &name)).await??;
            println!("{}", content);
            false
        }
        FilesAction::Delete { name, yes } => {
            tokio::task::spawn_blocking(move || -> Result<bool> {
                files::resolve(&db, &name)?;
                if !yes && !files::confirm(&format!("Delete '{}'?", name))? {
                    println!("Deletion cancelled.");
                    return Ok(false);
                }
                files::delete(&db, &name)?;
                println!("Deleted '{}'.", name);
                Ok(true)
            })
            .await??
        }
        FilesAction::Add { name } => {
            let editor = files::editor_command();
            tokio::task::spawn_blocking(move || files::add(&db, &name, &editor)).await??;
            println!("File added.");
            true
        }
        FilesAction::Edit { name } => {
            let editor = files::editor_command();
            tokio::task::spawn_blocking(move || files::edit(&db, &name, &editor)).await??;
            println!("File saved.");
            true
        }
    };

    // No listing task runs here; a running `run` picks the change up on its
    // next periodic scan.
    if changed {
        let listing = scan_directory(&paths.db).await?;
        println!("{} snapshot file(s) on disk.", listing.len());
    }
    Ok(())
}

async fn cmd_config(paths: &DataPaths, action: ConfigAction) -> Result<()> {
    let config = open_config(paths)?;

    match action {
        ConfigAction::Show => {
            let mut data = config.load()?;
            if data.password.is_some() {
                data.password = Some("********".to_string());
            }
            println!("{}", data.to_json()?);
        }
        ConfigAction::SetUrl { url } => {
            config.set_api_url(&url)?;
            println!("API URL set to {}", url);
        }
        ConfigAction::SetPing { url } => {
            config.set_ping(&url)?;
            println!("Ping host set to {}", url);
        }
        ConfigAction::SetInterval { minutes } => {
            config.set_interval_minutes(minutes)?;
            println!("Sync interval set to {} minute(s)", minutes);
        }
        ConfigAction::SetCredentials { username } => {
            let password = tokio::task::spawn_blocking(|| {
                rpassword::prompt_password("Password: ").context("Failed to read password")
            })
            .await??;
            let password = zeroize::Zeroizing::new(password);
            config.set_credentials(&username, &password)?;
            println!("Credentials saved for {}", username);
        }
    }
    Ok(())
}

async fn cmd_ping(paths: &DataPaths) -> Result<()> {
    let config = open_config(paths)?;
    ping(config).await
}

async fn ping(config: Arc<FileConfig>) -> Result<()> {
    let source: Arc<dyn ConfigSource> = config.clone();
    let url = read_config(&source, |c| c.ping_url()).await?;
    let client = ApiClient::new(config)?;

    match client.ping().await {
        Ok(status) => {
            println!("{} is reachable (HTTP {})", url, status);
            Ok(())
        }
        Err(e) => {
            error!("Ping to {} failed: {}", url, e);
            anyhow::bail!("{} is not reachable: {}", url, e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clientsync_sync::spawn_listing_task;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_log_sink_keeps_earlier_runs() {
        let temp = TempDir::new().unwrap();

        let mut first = open_log_appender(temp.path()).unwrap();
        writeln!(first, "first run").unwrap();
        first.flush().unwrap();
        drop(first);

        let mut second = open_log_appender(temp.path()).unwrap();
        writeln!(second, "second run").unwrap();
        second.flush().unwrap();
        drop(second);

        let content = std::fs::read_to_string(temp.path().join(LOG_FILE)).unwrap();
        assert_eq!(content, "first run\nsecond run\n");
    }

    #[test]
    fn test_data_paths() {
        let paths = DataPaths::new(Path::new("/srv/clientsync"));
        assert_eq!(paths.db, Path::new("/srv/clientsync/db"));
        assert_eq!(paths.logs, Path::new("/srv/clientsync/logs"));
        assert_eq!(paths.config, Path::new("/srv/clientsync/config.json"));
    }

    #[tokio::test]
    async fn test_file_changes_reach_live_listing() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("clients.json"), "[]").unwrap();

        let (mut publisher, listing) = ListingPublisher::new(temp.path());
        publisher.refresh().await.unwrap();
        // Long cadence: only the forced refresh can publish in time.
        let task = spawn_listing_task(publisher, Duration::from_secs(3600), Duration::from_secs(3600));
        assert!(listing.current().contains("clients.json"));

        let db = temp.path().to_path_buf();
        let after = change_files(&listing, move || files::delete(&db, "clients.json"))
            .await
            .unwrap();
        assert!(after.is_empty());
        assert!(listing.current().is_empty());

        #[cfg(unix)]
        {
            let db = temp.path().to_path_buf();
            change_files(&listing, move || files::add(&db, "notes.json", "true"))
                .await
                .unwrap();
            assert!(listing.current().contains("notes.json"));
        }

        let db = temp.path().to_path_buf();
        assert!(change_files(&listing, move || files::delete(&db, "missing.json"))
            .await
            .is_err());

        task.cancel();
        task.join().await.unwrap();
    }
}
