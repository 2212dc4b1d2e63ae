//! RxP Client - interactive file transfer client
//!
//! Connects to an RxP server and offers a small shell:
//! `get F`, `post F`, `window N`, `status`, `disconnect`.

use anyhow::Context;
use clap::Parser;
use rxp::{Connection, ConnectionState, Listener};
use rxp_cli::{connection_summary, fxa, init_logging, Config, Session};
use std::fs;
use std::io::{self, BufRead, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "rxp-client")]
#[command(about = "RxP file transfer client", long_about = None)]
struct Args {
    /// Server address
    #[arg(short, long)]
    remote: Option<SocketAddr>,

    /// Local port (0 picks one)
    #[arg(short, long)]
    port: Option<u16>,

    /// Local bind address
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Send window size
    #[arg(short, long)]
    window: Option<usize>,

    /// Directory downloaded files are saved to
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let file = Config::load(args.config.as_deref())?;
    let config = file.protocol.to_rxp()?;
    let window = args.window.unwrap_or(config.window_size);

    let remote = args
        .remote
        .or(file.endpoint.remote)
        .context("No server address given (use --remote or [endpoint] remote)")?;
    let mut local = file
        .endpoint
        .bind
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 0)));
    if let Some(ip) = args.bind {
        local.set_ip(ip);
    }
    if let Some(port) = args.port {
        local.set_port(port);
    }
    let root = args
        .dir
        .or(file.endpoint.directory)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&root)
        .with_context(|| format!("Failed to create directory '{}'", root.display()))?;

    let close_timeout = config.close_timeout;
    tracing::info!("Connecting to {} from {}", remote, local);
    let connection = Listener::connect(local, remote, window, config)?;
    tracing::info!("Connected: {}", connection_summary(&connection));

    let receiving = connection.clone();
    thread::Builder::new()
        .name("rxp-download".to_string())
        .spawn(move || download_loop(receiving, root))?;

    shell(&connection)?;

    connection.close()?;
    let deadline = Instant::now() + close_timeout;
    while connection.state() != ConnectionState::Closed && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }
    println!("Disconnected ({})", connection.state());
    Ok(())
}

fn download_loop(connection: Connection, root: PathBuf) {
    let mut session = Session::new(root);
    loop {
        let bytes = connection.receive(512);
        if bytes.is_empty() {
            break;
        }
        match session.on_bytes(&connection, &bytes) {
            Ok(completed) => {
                for path in completed {
                    println!("\nDownloaded {}", path.display());
                }
            }
            Err(e) => tracing::warn!("Transfer error: {}", e),
        }
    }
    tracing::debug!("Download loop finished");
}

fn shell(connection: &Connection) -> anyhow::Result<()> {
    let stdin = io::stdin();
    prompt()?;

    for line in stdin.lock().lines() {
        let line = line?;
        let mut words = line.split_whitespace();

        let result: anyhow::Result<()> = match (words.next(), words.next()) {
            (Some("disconnect"), _) => return Ok(()),
            (Some("get"), Some(name)) => fxa::request_file(connection, name).map_err(Into::into),
            (Some("post"), Some(path)) => post(connection, Path::new(path)),
            (Some("window"), Some(size)) => match size.parse::<usize>() {
                Ok(size) => connection.set_window_size(size).map_err(Into::into),
                Err(_) => Err(anyhow::anyhow!("window size is not an integer")),
            },
            (Some("status"), _) => {
                println!("{}", connection_summary(connection));
                Ok(())
            }
            (None, _) => Ok(()),
            _ => {
                println!("Commands: get F | post F | window N | status | disconnect");
                Ok(())
            }
        };
        if let Err(e) = result {
            println!("ERROR {}", e);
        }
        if connection.state() != ConnectionState::Established {
            println!("Connection is {}", connection.state());
            return Ok(());
        }
        prompt()?;
    }
    Ok(())
}

fn post(connection: &Connection, path: &Path) -> anyhow::Result<()> {
    let contents =
        fs::read(path).with_context(|| format!("Failed to read '{}'", path.display()))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("'{}' has no file name", path.display()))?;
    fxa::send_file(connection, name, &contents)?;
    println!("Uploading {} ({} bytes)", name, contents.len());
    Ok(())
}

fn prompt() -> io::Result<()> {
    print!("rxp-client> ");
    io::stdout().flush()
}
