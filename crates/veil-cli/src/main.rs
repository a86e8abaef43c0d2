//! VEIL CLI
//!
//! Run an echo or sink server, push traffic at one, or list cipher suites.

mod progress;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use progress::{SendProgress, format_bytes, format_speed};
use veil_core::{Client, EchoHandler, ModeConf, Server, SessionConfig, SessionHandler, SinkHandler};
use veil_crypto::CipherSuite;
use veil_transport::{Tuning, TuningReport};

/// VEIL - reliable encrypted sessions over UDP
#[derive(Parser)]
#[command(name = "veil")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the cipher suite
    #[arg(long, global = true)]
    crypt: Option<String>,

    /// Override the mode preset (normal, fast, fast2, fast3)
    #[arg(long, global = true)]
    mode: Option<String>,

    /// Override the passphrase
    #[arg(long, global = true)]
    seed: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept sessions until interrupted
    Serve {
        /// Listen address
        #[arg(short, long, default_value = "0.0.0.0:29900")]
        listen: String,

        /// What to do with each session
        #[arg(long, value_enum, default_value_t = HandlerKind::Echo)]
        handler: HandlerKind,
    },

    /// Send messages to a server
    Send {
        /// Server address
        #[arg(short, long)]
        remote: String,

        /// Number of messages
        #[arg(short = 'n', long, default_value_t = 100)]
        count: usize,

        /// Bytes per message
        #[arg(short, long, default_value_t = 1024)]
        size: usize,

        /// Read everything back and compare (for echo servers)
        #[arg(long)]
        echo: bool,
    },

    /// List supported cipher suites
    Suites,
}

#[derive(Clone, Copy, ValueEnum)]
enum HandlerKind {
    Echo,
    Sink,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose { "debug" } else { "info" })
        .init();

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Serve { listen, handler } => {
            serve(&listen, handler, &config).await?;
        }
        Commands::Send {
            remote,
            count,
            size,
            echo,
        } => {
            send(&remote, count, size, echo, &config).await?;
        }
        Commands::Suites => list_suites(),
    }

    Ok(())
}

/// Load the config file (if any), then apply command-line overrides
fn load_config(cli: &Cli) -> anyhow::Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };

    if let Some(crypt) = &cli.crypt {
        config.crypt.clone_from(crypt);
    }
    if let Some(mode) = &cli.mode {
        config.mode = ModeConf::preset(mode);
    }
    if let Some(seed) = &cli.seed {
        config.seed.clone_from(seed);
    }

    config.validate()?;
    Ok(config)
}

/// Run a server until Ctrl+C
async fn serve(listen: &str, kind: HandlerKind, config: &SessionConfig) -> anyhow::Result<()> {
    let handler: Arc<dyn SessionHandler> = match kind {
        HandlerKind::Echo => Arc::new(EchoHandler),
        HandlerKind::Sink => Arc::new(SinkHandler::new()),
    };
    let server = Server::bind(listen, config, Some(handler)).await?;

    println!("Listening on: {}", server.local_addr()?);
    println!("Cipher: {}", config.suite());
    println!("MTU: {}", config.mtu);
    print_tuning(server.tuning_report());
    println!("Press Ctrl+C to stop");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("interrupted, shutting down");
        }
        () = server.closed() => {
            tracing::warn!("accept loop ended");
        }
    }

    server.close().await?;
    Ok(())
}

/// Send `count` messages of `size` bytes
async fn send(
    remote: &str,
    count: usize,
    size: usize,
    echo: bool,
    config: &SessionConfig,
) -> anyhow::Result<()> {
    if size == 0 {
        anyhow::bail!("message size must be non-zero");
    }

    let client = Client::connect(remote, config).await?;
    tracing::info!(conv = client.conv(), "connected to {}", remote);
    print_tuning(client.tuning_report());

    let total = (count * size) as u64;
    let progress = SendProgress::new(total, remote)?;
    let started = Instant::now();

    let mut message = vec![0u8; size];
    for i in 0..count {
        message.fill((i % 251) as u8);
        if let Err(e) = client.write(&message).await {
            progress.abandon();
            return Err(e.into());
        }
        progress.advance(size as u64);
    }
    progress.finish_with_message(format!("Sent {} messages", count));

    if echo {
        let mut received = 0usize;
        let mut buf = vec![0u8; size.max(4096)];
        while received < count * size {
            let n = client.read(&mut buf).await?;
            if n == 0 {
                anyhow::bail!("server closed after {} of {} bytes", received, count * size);
            }
            for (offset, byte) in buf[..n].iter().enumerate() {
                let expected = (((received + offset) / size) % 251) as u8;
                if *byte != expected {
                    anyhow::bail!("echo mismatch at byte {}", received + offset);
                }
            }
            received += n;
        }
        println!("Echo verified: {}", format_bytes(received as u64));
    }

    let elapsed = started.elapsed().as_secs_f64();
    println!(
        "Transferred {} in {:.2}s ({})",
        format_bytes(total),
        elapsed,
        format_speed(total, elapsed)
    );
    let stats = client.stats();
    println!(
        "Datagrams sent: {}, dropped on receive: {}",
        stats.conn.packets_sent, stats.dropped_datagrams
    );

    client.close().await?;
    Ok(())
}

/// Print the supported suites
fn list_suites() {
    println!("{:<10} {:>8} {:>6}", "SUITE", "KEY", "BLOCK");
    for suite in CipherSuite::all() {
        let block = suite
            .block_size()
            .map_or_else(|| "-".to_string(), |b| b.to_string());
        println!("{:<10} {:>8} {:>6}", suite.name(), suite.key_len(), block);
    }
    println!("\nUnknown names fall back to {}.", CipherSuite::DEFAULT);
}

/// Print socket tuning outcomes
fn print_tuning(report: &TuningReport) {
    for (what, outcome) in [
        ("DSCP", &report.dscp),
        ("Receive buffer", &report.recv_buffer),
        ("Send buffer", &report.send_buffer),
    ] {
        match outcome {
            Tuning::Applied => println!("{what}: applied"),
            Tuning::Skipped => {}
            Tuning::Rejected(reason) => println!("{what}: not applied ({reason})"),
        }
    }
}
