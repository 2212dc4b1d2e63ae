//! RxP Server - file transfer endpoint
//!
//! Accepts RxP connections, answers `get` requests from a directory and
//! stores uploaded files in it.

use clap::Parser;
use parking_lot::Mutex;
use rxp::{Connection, ConnectionState, Listener};
use rxp_cli::{connection_summary, format_duration, init_logging, Config, Session};
use std::io::{self, BufRead, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "rxp-server")]
#[command(about = "RxP file transfer server", long_about = None)]
struct Args {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Directory to serve files from and store uploads in
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Send window for accepted connections
    #[arg(short, long)]
    window: Option<usize>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

type Clients = Arc<Mutex<Vec<Connection>>>;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let file = Config::load(args.config.as_deref())?;
    let mut protocol = file.protocol.clone();
    if let Some(window) = args.window {
        protocol.window_size = window;
    }
    let config = protocol.to_rxp()?;

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
    if local.port() == 0 {
        anyhow::bail!("No listen port given (use --port or [endpoint] bind)");
    }
    let root = args
        .dir
        .or(file.endpoint.directory)
        .unwrap_or_else(|| PathBuf::from("."));

    let close_timeout = config.close_timeout;
    let listener = Listener::listen(local, config)?;
    tracing::info!("RxP Server starting...");
    tracing::info!(
        "Listening on {}, serving {}",
        listener.local_addr(),
        root.display()
    );

    let clients: Clients = Arc::new(Mutex::new(Vec::new()));
    let accepted = Arc::clone(&clients);
    thread::Builder::new()
        .name("rxp-accept".to_string())
        .spawn(move || accept_loop(listener, accepted, root))?;

    shell(&clients)?;

    for connection in clients.lock().iter() {
        if let Err(e) = connection.close() {
            tracing::warn!("Close of {} failed: {}", connection.remote_addr(), e);
        }
    }
    wait_closed(&clients, close_timeout);
    println!("Server End - Goodbye");
    Ok(())
}

fn accept_loop(listener: Listener, clients: Clients, root: PathBuf) {
    loop {
        match listener.accept() {
            Ok(connection) => {
                tracing::info!("Client connected: {}", connection.remote_addr());
                clients.lock().push(connection.clone());

                let root = root.clone();
                let spawned = thread::Builder::new()
                    .name(format!("rxp-client-{}", connection.remote_addr()))
                    .spawn(move || handle_client(connection, root));
                if let Err(e) = spawned {
                    tracing::error!("Failed to start client thread: {}", e);
                }
            }
            Err(e) => tracing::warn!("Accept failed: {}", e),
        }
    }
}

fn handle_client(connection: Connection, root: PathBuf) {
    let started = Instant::now();
    let mut session = Session::new(root);

    loop {
        let bytes = connection.receive(512);
        if bytes.is_empty() {
            break;
        }
        if let Err(e) = session.on_bytes(&connection, &bytes) {
            tracing::warn!("Client {}: {}", connection.remote_addr(), e);
        }
    }

    tracing::info!(
        "Client {} disconnected after {}",
        connection.remote_addr(),
        format_duration(started.elapsed())
    );
}

fn shell(clients: &Clients) -> anyhow::Result<()> {
    let stdin = io::stdin();
    prompt()?;

    for line in stdin.lock().lines() {
        let line = line?.to_lowercase();
        let mut words = line.split_whitespace();

        match (words.next(), words.next()) {
            (Some("terminate"), _) => return Ok(()),
            (Some("window"), Some(size)) => match size.parse::<usize>() {
                Ok(size) => {
                    for connection in clients.lock().iter() {
                        if let Err(e) = connection.set_window_size(size) {
                            println!("ERROR {}: {}", connection.remote_addr(), e);
                        }
                    }
                }
                Err(_) => println!("ERROR window size is not an integer"),
            },
            (Some("status"), _) => {
                let clients = clients.lock();
                if clients.is_empty() {
                    println!("No clients");
                }
                for connection in clients.iter() {
                    println!("{}", connection_summary(connection));
                }
            }
            (None, _) => {}
            _ => println!("Commands: window N | status | terminate"),
        }
        prompt()?;
    }
    Ok(())
}

fn prompt() -> io::Result<()> {
    print!("rxp-server> ");
    io::stdout().flush()
}

fn wait_closed(clients: &Clients, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        let open = clients
            .lock()
            .iter()
            .any(|c| c.state() != ConnectionState::Closed);
        if !open {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
}
