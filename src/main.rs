//! gcs-driver -- command-line access to virtual files in Cloud Storage.

use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use gcs_driver::config::{load_config, Config};
use gcs_driver::{CloseStatus, Driver};
use tracing::info;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "gcs-driver",
    version,
    about = "Read, write and append Cloud Storage objects as files"
)]
struct Cli {
    /// Path to a YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print Prometheus metrics to stderr on exit.
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Logical size of a file or shard glob.
    Size { uri: String },
    /// Whether a file (or, with a trailing `/`, a directory) exists.
    Exists { uri: String },
    /// Write file content to stdout.
    Cat {
        uri: String,
        /// Start offset.
        #[arg(long, default_value_t = 0)]
        offset: i64,
        /// Bytes to print; everything up to the end by default.
        #[arg(long)]
        length: Option<u64>,
    },
    /// Download to a local file.
    Get { uri: String, local: PathBuf },
    /// Upload a local file.
    Put { local: PathBuf, uri: String },
    /// Append a local file to an object, creating it when missing.
    Append { local: PathBuf, uri: String },
    /// Delete an object.
    Rm { uri: String },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => load_config(path)?,
        None => Config::default(),
    };
    config.apply_env();

    if cli.metrics {
        gcs_driver::metrics::init_metrics()?;
        gcs_driver::metrics::describe_metrics();
    }

    let mut driver = Driver::new(config)?;
    if !driver.connect() {
        anyhow::bail!("{}", last_error(&driver));
    }
    info!("{} {} connected", driver.driver_name(), driver.version());

    let outcome = run(&mut driver, cli.command);

    if !driver.disconnect() {
        eprintln!("{}", last_error(&driver));
    }
    if cli.metrics {
        eprint!("{}", gcs_driver::metrics::init_metrics()?.render());
    }
    outcome
}

fn run(driver: &mut Driver, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Size { uri } => {
            let size = driver.get_file_size(&uri);
            if size < 0 {
                anyhow::bail!("{}", last_error(driver));
            }
            println!("{size}");
        }
        Command::Exists { uri } => {
            let exists = driver.exists(&uri);
            println!("{exists}");
            if !exists {
                anyhow::bail!("{uri} does not exist");
            }
        }
        Command::Cat {
            uri,
            offset,
            length,
        } => cat(driver, &uri, offset, length)?,
        Command::Get { uri, local } => {
            if !driver.copy_to_local(&uri, &local) {
                anyhow::bail!("{}", last_error(driver));
            }
        }
        Command::Put { local, uri } => {
            if !driver.copy_from_local(&local, &uri) {
                anyhow::bail!("{}", last_error(driver));
            }
        }
        Command::Append { local, uri } => append(driver, &local, &uri)?,
        Command::Rm { uri } => {
            if !driver.remove(&uri) {
                anyhow::bail!("{}", last_error(driver));
            }
        }
    }
    Ok(())
}

fn cat(driver: &mut Driver, uri: &str, offset: i64, length: Option<u64>) -> anyhow::Result<()> {
    let size = driver.get_file_size(uri);
    if size < 0 {
        anyhow::bail!("{}", last_error(driver));
    }
    let id = driver
        .open(uri, 'r')
        .ok_or_else(|| anyhow::anyhow!("{}", last_error(driver)))?;
    if driver.seek(id, offset, 0) != 0 {
        anyhow::bail!("{}", last_error(driver));
    }

    let available = u64::try_from(size.saturating_sub(offset)).unwrap_or(0);
    let mut remaining = length.map_or(available, |l| l.min(available));
    let chunk = usize::try_from(driver.preferred_buffer_size()).unwrap_or(4 * 1024 * 1024);
    let mut buf = vec![0u8; chunk.max(1)];
    let mut stdout = std::io::stdout().lock();

    while remaining > 0 {
        let want = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let n = driver.read(id, &mut buf[..want], 1, want);
        if n < 0 {
            anyhow::bail!("{}", last_error(driver));
        }
        if n == 0 {
            break;
        }
        stdout.write_all(&buf[..n as usize])?;
        remaining -= n as u64;
    }
    stdout.flush()?;

    driver.close(id);
    Ok(())
}

fn append(driver: &mut Driver, local: &Path, uri: &str) -> anyhow::Result<()> {
    let data = std::fs::read(local)?;
    let id = driver
        .open(uri, 'a')
        .ok_or_else(|| anyhow::anyhow!("{}", last_error(driver)))?;
    if !data.is_empty() && driver.write(id, &data, 1, data.len()) < 0 {
        driver.close(id);
        anyhow::bail!("{}", last_error(driver));
    }
    if driver.close(id) != CloseStatus::Closed {
        anyhow::bail!("{}", last_error(driver));
    }
    info!("appended {} bytes to {}", data.len(), uri);
    Ok(())
}

fn last_error(driver: &Driver) -> String {
    driver
        .last_error()
        .unwrap_or("unknown driver error")
        .to_string()
}
