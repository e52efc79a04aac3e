//! gauntlet CLI - manage WebDriver tunnels and inspect configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use gauntlet::config::{self, Config, TunnelKind};
use gauntlet::environment::{self, EnvironmentRequest};
use gauntlet::tunnel::{self, Tunnel, TunnelConfig, TunnelEvent, TunnelProvider};

#[derive(Parser)]
#[command(name = "gauntlet")]
#[command(about = "Hierarchical test runner with managed WebDriver tunnels", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = config::DEFAULT_PATH)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download the tunnel binaries
    Download {
        /// Download again even if already installed
        #[arg(short, long)]
        force: bool,
    },

    /// List the environments the tunnel offers, filtered by the configuration
    Environments {
        /// Print JSON instead of one line per environment
        #[arg(long)]
        json: bool,
    },

    /// Start the tunnel and keep it running until Ctrl-C
    Tunnel,

    /// Validate configuration file
    Validate,

    /// Write a starter configuration file
    Init,
}

/// Builds the configured tunnel and binds it to `$tunnel` for `$body`.
///
/// The CLI installs into the shared per-version cache directory unless the
/// configuration names one, so `download` and `tunnel` see the same files.
macro_rules! with_tunnel {
    ($config:expr, |$tunnel:ident| $body:expr) => {{
        let tunnel_config = $config.tunnel.tunnel_config()?;
        match $config.tunnel.kind {
            TunnelKind::Selenium => {
                let provider = $config.tunnel.selenium.provider();
                let $tunnel = Tunnel::new(provider.clone(), cached(tunnel_config, &provider))?;
                $body
            }
            TunnelKind::BrowserStack => {
                let provider = $config.tunnel.browserstack.provider();
                let $tunnel = Tunnel::new(provider.clone(), cached(tunnel_config, &provider))?;
                $body
            }
        }
    }};
}

fn cached<P: TunnelProvider>(mut config: TunnelConfig, provider: &P) -> TunnelConfig {
    if config.directory.is_none() {
        config.directory = Some(tunnel::cache_directory(provider.name(), provider.version()));
    }
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Download { force } => {
            let config = load(&cli.config)?;
            with_tunnel!(config, |tunnel| download(&tunnel, force).await)
        }
        Commands::Environments { json } => {
            let config = load(&cli.config)?;
            with_tunnel!(config, |tunnel| {
                list_environments(&tunnel, &config.environments, json).await
            })
        }
        Commands::Tunnel => {
            let config = load(&cli.config)?;
            with_tunnel!(config, |tunnel| run_tunnel(&tunnel).await)
        }
        Commands::Validate => validate_config(&cli.config),
        Commands::Init => init_config(&cli.config),
    }
}

fn load(path: &Path) -> Result<Config> {
    let config = config::load_config(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// One progress bar per artifact, driven by download events.
struct DownloadBars {
    style: ProgressStyle,
    current: Option<(String, ProgressBar)>,
}

impl DownloadBars {
    fn new() -> Result<Self> {
        let style = ProgressStyle::with_template(
            "{msg:20} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
        )?
        .progress_chars("#>-");
        Ok(Self {
            style,
            current: None,
        })
    }

    fn update(&mut self, event: TunnelEvent) {
        let TunnelEvent::DownloadProgress {
            artifact,
            loaded,
            total,
        } = event
        else {
            return;
        };

        if self.current.as_ref().is_none_or(|(name, _)| *name != artifact) {
            self.finish();
            let bar = match total {
                Some(total) => ProgressBar::new(total).with_style(self.style.clone()),
                None => ProgressBar::new_spinner(),
            };
            bar.set_message(artifact.clone());
            self.current = Some((artifact, bar));
        }
        if let Some((_, bar)) = &self.current {
            bar.set_position(loaded);
        }
    }

    fn finish(&mut self) {
        if let Some((_, bar)) = self.current.take() {
            bar.finish();
        }
    }
}

async fn download<P: TunnelProvider>(tunnel: &Tunnel<P>, force: bool) -> Result<()> {
    let mut events = tunnel.subscribe();
    let mut bars = DownloadBars::new()?;

    let download = tunnel.download(force);
    tokio::pin!(download);
    let result = loop {
        tokio::select! {
            result = &mut download => break result,
            event = events.recv() => match event {
                Ok(event) => bars.update(event),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => {}
            },
        }
    };
    bars.finish();
    result?;

    println!(
        "{} {} installed in {}",
        tunnel.provider().name(),
        tunnel.provider().version(),
        tunnel.directory().display()
    );
    Ok(())
}

async fn list_environments<P: TunnelProvider>(
    tunnel: &Tunnel<P>,
    requests: &[EnvironmentRequest],
    json: bool,
) -> Result<()> {
    let available = tunnel.environments().await?;
    let environments = if requests.is_empty() {
        available
    } else {
        environment::resolve(requests, &available)?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&environments)?);
    } else {
        for environment in &environments {
            println!("{}", environment);
        }
    }
    Ok(())
}

async fn run_tunnel<P: TunnelProvider>(tunnel: &Tunnel<P>) -> Result<()> {
    download(tunnel, false).await?;

    let mut events = tunnel.subscribe();
    tunnel.start().await?;
    println!("Tunnel running at {}", tunnel.config().url());
    println!("Press Ctrl-C to stop");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let exit_code = loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result.context("Failed to listen for Ctrl-C")?;
                break None;
            }
            event = events.recv() => match event {
                Ok(TunnelEvent::Exited { code, unexpected: true }) => break Some(code),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break None,
            },
        }
    };

    if let Some(code) = exit_code {
        bail!("Tunnel exited unexpectedly (exit code {:?})", code);
    }

    tunnel.stop().await?;
    println!("Tunnel stopped");
    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    let config = config::load_config(config_path)?;
    config.gauntlet.run_options()?;
    let tunnel = config.tunnel.tunnel_config()?;

    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    println!("  Default timeout: {}ms", config.gauntlet.default_timeout_ms);
    println!("  Max concurrency: {}", config.gauntlet.max_concurrency);
    println!("  Bail: {}", config.gauntlet.bail);
    if let Some(grep) = &config.gauntlet.grep {
        println!("  Grep: {}", grep);
    }

    let provider_name = match config.tunnel.kind {
        TunnelKind::Selenium => "selenium",
        TunnelKind::BrowserStack => "browserstack",
    };
    println!("  Tunnel: {} at {}", provider_name, tunnel.url());
    println!("  Environments: {}", config.environments.len());

    Ok(())
}

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        bail!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
    }

    std::fs::write(path, config::STARTER_CONFIG)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  gauntlet download");

    Ok(())
}
