use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use emberd_chain::{genesis_block, ChainEngine, MemoryChain};
use emberd_net::{NetConfig, Network, DEFAULT_PORT};
use emberd_storage::fjall::FjallStore;
use emberd_storage::{KeyValueStore, Table};

const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_SEED_FILE: &str = "peers.txt";
const SCHEMA_VERSION: u32 = 1;
const STATUS_INTERVAL_SECS: u64 = 30;

struct Config {
    data_dir: PathBuf,
    seed_file: PathBuf,
    bind_addr: IpAddr,
    port: u16,
    public_addr: Option<IpAddr>,
    allow_loopback: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            seed_file: PathBuf::from(DEFAULT_SEED_FILE),
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            port: DEFAULT_PORT,
            public_addr: None,
            allow_loopback: false,
        }
    }
}

fn usage() -> String {
    [
        "emberd - networking node daemon",
        "",
        "Options:",
        "  --data-dir <path>       database directory (default: data)",
        "  --peers-file <path>     seed address list (default: peers.txt)",
        "  --bind <ip>             listen address (default: 0.0.0.0)",
        "  --port <port>           network port (default: 8704)",
        "  --public-addr <ip>      our own public address, never dialed",
        "  --allow-loopback        permit loopback peers (regtest clusters)",
        "  --help                  print this help",
    ]
    .join("\n")
}

fn parse_args() -> Result<Config, String> {
    let mut config = Config::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--data-dir" => {
                let value = args.next().ok_or("--data-dir requires a value")?;
                config.data_dir = PathBuf::from(value);
            }
            "--peers-file" => {
                let value = args.next().ok_or("--peers-file requires a value")?;
                config.seed_file = PathBuf::from(value);
            }
            "--bind" => {
                let value = args.next().ok_or("--bind requires a value")?;
                config.bind_addr = value
                    .parse()
                    .map_err(|_| format!("invalid bind address {value}"))?;
            }
            "--port" => {
                let value = args.next().ok_or("--port requires a value")?;
                config.port = value.parse().map_err(|_| format!("invalid port {value}"))?;
            }
            "--public-addr" => {
                let value = args.next().ok_or("--public-addr requires a value")?;
                let addr = value
                    .parse()
                    .map_err(|_| format!("invalid public address {value}"))?;
                config.public_addr = Some(addr);
            }
            "--allow-loopback" => config.allow_loopback = true,
            "--help" | "-h" => {
                println!("{}", usage());
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument {other}\n\n{}", usage())),
        }
    }
    Ok(config)
}

fn check_schema(store: &FjallStore) -> Result<(), String> {
    let key = b"schema_version";
    match store.get(Table::Meta, key).map_err(|err| err.to_string())? {
        Some(bytes) => {
            let found = u32::from_le_bytes(bytes.try_into().map_err(|_| "corrupt schema marker")?);
            if found != SCHEMA_VERSION {
                return Err(format!(
                    "database schema version {found} does not match {SCHEMA_VERSION}"
                ));
            }
        }
        None => {
            store
                .put(Table::Meta, key, &SCHEMA_VERSION.to_le_bytes())
                .map_err(|err| err.to_string())?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = parse_args()?;
    fs::create_dir_all(&config.data_dir).map_err(|err| err.to_string())?;

    let store = FjallStore::open(config.data_dir.join("db")).map_err(|err| err.to_string())?;
    check_schema(&store)?;
    let store = Arc::new(store);

    let engine = Arc::new(MemoryChain::with_genesis(genesis_block()));
    println!("chain tip at height {}", engine.tip_height());

    let net_config = NetConfig {
        bind_addr: config.bind_addr,
        port: config.port,
        public_addr: config.public_addr,
        seed_file: config.seed_file,
        allow_loopback: config.allow_loopback,
        ..NetConfig::default()
    };
    let network = Network::start(net_config, store, engine as Arc<dyn ChainEngine>)
        .await
        .map_err(|err| err.to_string())?;
    println!("emberd listening on {}", network.local_addr());

    let mut status = tokio::time::interval(Duration::from_secs(STATUS_INTERVAL_SECS));
    status.tick().await; // the first tick fires immediately
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.map_err(|err| err.to_string())?;
                println!("shutting down");
                break;
            }
            _ = status.tick() => {
                println!(
                    "height {} of {} ({} peers, {:.1}% synced)",
                    network.current_height(),
                    network.best_height(),
                    network.connections(),
                    network.sync_progress() * 100.0
                );
            }
        }
    }

    network.shutdown().await;
    Ok(())
}
