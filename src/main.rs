use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ringpool::clients::{memcache, rabbitmq, redis};
use ringpool::config::{Config, LoggingConfig};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ringpool")]
#[command(about = "Pooled Redis, Memcache and RabbitMq clients with consistent hashing")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an example configuration file
    Config {
        /// Configuration mode (cluster or masterSlave)
        #[arg(short, long, default_value = "cluster")]
        mode: String,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate a configuration file
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Run a command against the configured Redis pool
    Redis {
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
        #[command(subcommand)]
        op: Op,
    },
    /// Run a command against the configured Memcache pool
    Memcache {
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
        #[command(subcommand)]
        op: Op,
    },
    /// Publish to or declare the configured RabbitMq exchange
    Rabbitmq {
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
        #[command(subcommand)]
        op: RabbitOp,
    },
    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum RabbitOp {
    /// Declare the exchange on the server serving `op_code`
    Declare {
        op_code: String,
    },
    Publish {
        op_code: String,
        body: String,
        #[arg(long, default_value = "")]
        op_uid: String,
        #[arg(long, default_value = "cli")]
        log_id: String,
    },
}

#[derive(Subcommand)]
enum Op {
    Get {
        key: String,
    },
    Set {
        key: String,
        value: String,
        /// Expiry in seconds
        #[arg(short, long)]
        expire: Option<u64>,
    },
    Del {
        key: String,
    },
    Incr {
        key: String,
        #[arg(default_value_t = 1, allow_hyphen_values = true)]
        delta: i64,
    },
    /// Ping (redis) or ask the version of (memcache) every configured server
    Ping,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config { mode, output } => generate_config(&mode, &output),
        Commands::Validate { config } => validate_config(&config),
        Commands::Redis { config, op } => run_redis(&config, op).await,
        Commands::Memcache { config, op } => run_memcache(&config, op).await,
        Commands::Rabbitmq { config, op } => run_rabbitmq(&config, op).await,
        Commands::Version => {
            show_version();
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> Result<Config> {
    let config = Config::load_from_file(path)
        .with_context(|| format!("failed to load config from {:?}", path))?;
    init_logging(&config.logging)?;
    info!("Configuration loaded from: {:?}", path);
    Ok(config)
}

async fn run_redis(path: &Path, op: Op) -> Result<()> {
    let config = load_config(path)?;
    let Some(section) = config.redis else {
        bail!("no [redis] section in {:?}", path);
    };
    let client = redis::Client::new(&section).await?;

    match op {
        Op::Get { key } => print_value(client.get(&key).await),
        Op::Set { key, value, expire } => {
            let expire = expire.map(std::time::Duration::from_secs);
            println!("{}", client.set(&key, value, expire).await);
        }
        Op::Del { key } => println!("{}", client.del(&key).await),
        Op::Incr { key, delta } => println!("{}", client.incr(&key, delta).await),
        Op::Ping => {
            for (addr, _) in client.pool().servers() {
                let status = if client.ping(&addr).await { "PONG" } else { "unreachable" };
                println!("{}: {}", addr, status);
            }
        }
    }
    Ok(())
}

async fn run_memcache(path: &Path, op: Op) -> Result<()> {
    let config = load_config(path)?;
    let Some(section) = config.memcache else {
        bail!("no [memcache] section in {:?}", path);
    };
    let client = memcache::Client::new(&section).await?;

    match op {
        Op::Get { key } => print_value(client.get(&key).await),
        Op::Set { key, value, expire } => {
            let expire = expire.map(std::time::Duration::from_secs);
            println!("{}", client.set(&key, value, expire).await);
        }
        Op::Del { key } => println!("{}", client.del(&key).await),
        Op::Incr { key, delta } => println!("{}", client.incr(&key, delta).await),
        Op::Ping => {
            for (addr, _) in client.pool().servers() {
                match client.version(&addr).await {
                    Ok(version) => println!("{}: {}", addr, version),
                    Err(e) => println!("{}: {}", addr, e),
                }
            }
        }
    }
    Ok(())
}

async fn run_rabbitmq(path: &Path, op: RabbitOp) -> Result<()> {
    let config = load_config(path)?;
    let Some(section) = config.rabbitmq else {
        bail!("no [rabbitmq] section in {:?}", path);
    };
    let client = rabbitmq::Client::new(&section).await?;

    match op {
        RabbitOp::Declare { op_code } => {
            client.try_declare_exchange(&op_code).await?;
            println!("declared {}", client.exchange_name());
        }
        RabbitOp::Publish {
            op_code,
            body,
            op_uid,
            log_id,
        } => {
            client.try_publish(&op_code, body, &op_uid, &log_id).await?;
            println!("published to {}", client.route_key(&op_code));
        }
    }
    Ok(())
}

fn print_value(value: Option<bytes::Bytes>) {
    match value {
        Some(data) => println!("{}", String::from_utf8_lossy(&data)),
        None => println!("(nil)"),
    }
}

fn generate_config(mode: &str, output: &Path) -> Result<()> {
    println!("Generating {} configuration file: {:?}", mode, output);

    Config::create_example_config(output, mode).context("failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  ringpool validate --config {:?}", output);
    Ok(())
}

fn validate_config(path: &Path) -> Result<()> {
    println!("Validating configuration file: {:?}", path);

    let config = match Config::load_from_file(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ Configuration file validation failed: {}", e);
            return Err(e.into());
        }
    };

    println!("✓ Configuration file is valid");
    if let Some(redis) = &config.redis {
        println!("  Redis ({:?}): {} servers", redis.mode, redis.servers.len());
        for (i, server) in redis.servers.iter().enumerate() {
            println!("    {}: {}", i + 1, server);
        }
    }
    if let Some(memcache) = &config.memcache {
        println!("  Memcache: {} servers", memcache.servers.len());
        for (i, server) in memcache.servers.iter().enumerate() {
            println!("    {}: {}", i + 1, server);
        }
    }
    if let Some(memory) = &config.memory {
        println!("  Memory: gc every {}ms", memory.gc_interval_ms);
    }
    if let Some(rabbitmq) = &config.rabbitmq {
        println!(
            "  RabbitMq ({} exchange pgo.{}): {} servers",
            rabbitmq.exchange_type,
            rabbitmq.exchange_name,
            rabbitmq.servers.len()
        );
    }
    Ok(())
}

fn show_version() {
    println!("ringpool v{}", env!("CARGO_PKG_VERSION"));
    println!("Pooled Redis, Memcache and RabbitMq clients with consistent hashing");
    println!();
    println!("Features:");
    println!("  • Weighted consistent-hash sharding (sha1crc32, md5, fnv)");
    println!("  • Redis master-slave routing with automatic failover");
    println!("  • Background health probing of every backend");
    println!("  • Concurrent multi-key operations");
    println!("  • Pooled RabbitMq channels with op code routing");
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(logging.ansi);

    let result = match logging.format.as_str() {
        "compact" => builder.compact().try_init(),
        _ => builder.try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    info!("Logging initialized at level: {}", logging.level);
    Ok(())
}
