//! Cloudbackup CLI - Command line interface for backups to cloud storage.
//!
//! This tool lists, uploads, downloads and removes files on Google Drive
//! and Yandex Disk, handling the OAuth login on the way.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use cloudbackup_common::{Locator, SortKey};
use cloudbackup_storage::{
    AuthenticationFlow, GDriveBackend, MemoryBackend, RemoteBackend, TokenStore, YaDiskBackend,
};
use cloudbackup_sync::{Pager, TreeSync, TreeSyncConfig, UploadConfig};

use config::BackendKind;

#[derive(Parser)]
#[command(name = "cloudbackup")]
#[command(about = "Cloudbackup - Back up files to Google Drive or Yandex Disk")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Storage backend.
    #[arg(short, long, value_enum, default_value_t = BackendKind::Gdrive)]
    storage: BackendKind,

    /// Directory holding client credentials and cached tokens.
    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and cache the credentials.
    Login,

    /// Forget cached credentials.
    Logout,

    /// List a directory, or every file when no locator is given.
    List {
        /// Directory to list.
        locator: Option<String>,

        /// Sort key: name, modified, created, size, folder, path, or rev_<key>.
        #[arg(long, default_value = "name")]
        sort: String,

        /// Entries per page.
        #[arg(long, default_value_t = 20)]
        page_size: u32,

        /// Print every page without asking.
        #[arg(short, long)]
        all: bool,
    },

    /// Show metadata of a remote object.
    Info {
        locator: String,
    },

    /// Download a file or directory tree.
    Download {
        /// Remote object to download.
        locator: String,

        /// Local directory to download into.
        #[arg(short, long, default_value = ".")]
        dest: PathBuf,

        /// Replace local files and directories that already exist.
        #[arg(long)]
        overwrite: bool,
    },

    /// Upload a file or directory tree.
    Upload {
        /// Local file or directory.
        path: PathBuf,

        /// Remote directory to upload into (default: root).
        #[arg(short, long)]
        parent: Option<String>,
    },

    /// Remove a remote object.
    Remove {
        locator: String,

        /// Delete permanently instead of moving to the trash.
        #[arg(long)]
        permanent: bool,

        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },
}

/// Backend plus the auth flow feeding it, built once per run.
struct Connection {
    backend: Arc<dyn RemoteBackend>,
    flow: Option<Arc<AuthenticationFlow>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => config::default_config_dir()?,
    };
    let conn = connect(cli.storage, &config_dir)?;

    match cli.command {
        Commands::Login => cmd_login(&conn).await,

        Commands::Logout => cmd_logout(&conn).await,

        Commands::List {
            locator,
            sort,
            page_size,
            all,
        } => cmd_list(&conn, locator.as_deref(), &sort, page_size, all).await,

        Commands::Info { locator } => cmd_info(&conn, &locator).await,

        Commands::Download {
            locator,
            dest,
            overwrite,
        } => cmd_download(&conn, &locator, &dest, overwrite).await,

        Commands::Upload { path, parent } => cmd_upload(&conn, &path, parent.as_deref()).await,

        Commands::Remove {
            locator,
            permanent,
            yes,
        } => cmd_remove(&conn, &locator, permanent, yes).await,
    }
}

/// Construct the selected backend.
fn connect(kind: BackendKind, config_dir: &Path) -> Result<Connection> {
    if kind == BackendKind::Memory {
        return Ok(Connection {
            backend: Arc::new(MemoryBackend::new()),
            flow: None,
        });
    }

    let auth = config::load_auth_config(kind, config_dir)
        .context("Failed to load client credentials")?;
    let flow = Arc::new(AuthenticationFlow::new(auth, TokenStore::new(config_dir))?);

    let backend: Arc<dyn RemoteBackend> = match kind {
        BackendKind::Gdrive => Arc::new(GDriveBackend::new(flow.clone())?),
        _ => Arc::new(YaDiskBackend::new(flow.clone())?),
    };

    Ok(Connection {
        backend,
        flow: Some(flow),
    })
}

fn parse_locator(value: &str) -> Result<Locator> {
    Locator::new(value).context("Invalid locator")
}

/// Ask a yes/no question on stdin.
fn confirm(question: &str, default_yes: bool) -> Result<bool> {
    let hint = if default_yes { "([y]/n)" } else { "(y/[n])" };
    print!("{} {} ", question, hint);
    std::io::stdout().flush()?;

    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("Failed to read answer")?;

    Ok(match answer.trim().to_lowercase().as_str() {
        "" => default_yes,
        "y" | "yes" => true,
        _ => false,
    })
}

/// Run the OAuth flow.
async fn cmd_login(conn: &Connection) -> Result<()> {
    let flow = conn
        .flow
        .as_ref()
        .context("This storage does not need a login")?;

    flow.authenticate().await.context("Login failed")?;
    println!("Logged in to {}", flow.backend_id());
    Ok(())
}

/// Remove cached tokens.
async fn cmd_logout(conn: &Connection) -> Result<()> {
    let flow = conn
        .flow
        .as_ref()
        .context("This storage does not need a login")?;

    flow.logout().await.context("Failed to remove credentials")?;
    println!("Logged out of {}", flow.backend_id());
    Ok(())
}

/// List page by page.
async fn cmd_list(
    conn: &Connection,
    locator: Option<&str>,
    sort: &str,
    page_size: u32,
    all: bool,
) -> Result<()> {
    let sort: SortKey = sort.parse().context("Invalid sort key")?;
    let parent = locator.map(parse_locator).transpose()?;
    info!("Listing {}", locator.unwrap_or("all files"));

    let mut pager = Pager::new(conn.backend.as_ref(), parent, page_size).with_sort(sort);
    let mut shown = 0usize;

    while let Some(page) = pager.next_page().await.context("Failed to list")? {
        for item in &page.items {
            println!("{}", item);
        }
        shown += page.len();

        if !page.has_next() || (!all && !confirm("List next page?", true)?) {
            break;
        }
    }

    if shown == 0 {
        println!("Nothing to list.");
    }
    Ok(())
}

/// Print remote metadata.
async fn cmd_info(conn: &Connection, locator: &str) -> Result<()> {
    let locator = parse_locator(locator)?;
    let file = conn
        .backend
        .get_metadata(&locator)
        .await
        .context("Failed to get metadata")?;

    println!("Name: {}", file.name);
    println!("  Locator: {}", file.locator);
    println!("  Kind: {:?}", file.kind);
    if let Some(size) = file.size {
        println!("  Size: {} bytes", size);
    }
    Ok(())
}

/// Download a tree.
async fn cmd_download(conn: &Connection, locator: &str, dest: &Path, overwrite: bool) -> Result<()> {
    let locator = parse_locator(locator)?;
    let config = TreeSyncConfig {
        overwrite,
        ..Default::default()
    };
    let sync = TreeSync::new(conn.backend.clone(), UploadConfig::default(), config);

    let report = sync
        .download(&locator, dest)
        .await
        .context("Download failed")?;

    println!(
        "Downloaded {} files ({} bytes) to {}",
        report.downloaded,
        report.bytes,
        dest.display()
    );
    for name in &report.skipped {
        println!("  Skipped {} (no downloadable content)", name);
    }
    Ok(())
}

/// Upload a tree.
async fn cmd_upload(conn: &Connection, path: &Path, parent: Option<&str>) -> Result<()> {
    let parent = parent.map(parse_locator).transpose()?;
    let sync = TreeSync::new(
        conn.backend.clone(),
        UploadConfig::default(),
        TreeSyncConfig::default(),
    );

    let report = sync
        .upload(path, parent.as_ref())
        .await
        .context("Upload failed")?;

    println!(
        "Uploaded {} files ({} bytes) from {}",
        report.uploaded,
        report.bytes,
        path.display()
    );
    for (local, remote) in report.mapping.iter() {
        println!("  {} -> {}", local.display(), remote);
    }
    Ok(())
}

/// Remove a remote object.
async fn cmd_remove(conn: &Connection, locator: &str, permanent: bool, yes: bool) -> Result<()> {
    let locator = parse_locator(locator)?;
    let file = conn
        .backend
        .get_metadata(&locator)
        .await
        .context("Failed to get metadata")?;

    let action = if permanent {
        "Permanently delete"
    } else {
        "Move to trash"
    };
    if !yes && !confirm(&format!("{} {}?", action, file), false)? {
        println!("Aborted.");
        return Ok(());
    }

    conn.backend
        .remove(&locator, permanent)
        .await
        .context("Failed to remove")?;
    println!("Removed: {}", file.name);
    Ok(())
}
