use crate::{
    decode_base64, install_prometheus_recorder, png_dimensions, run_server,
    AppState, CaptureService, Config, Notifier, ScrapeRequest,
};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "webshot-relay")]
#[command(about = "Headless screenshot service with callback delivery")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, global = true, help = "Maximum concurrent browser sessions")]
    pub max_concurrent: Option<usize>,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP service
    Serve {
        #[arg(long, help = "Bind address, e.g. 0.0.0.0:8000")]
        bind: Option<String>,

        #[arg(short, long, help = "Port, overriding the one in the bind address")]
        port: Option<u16>,
    },
    /// Capture one URL and write the PNG to disk
    Capture {
        #[arg(short, long, help = "URL to capture")]
        url: String,

        #[arg(short, long, help = "Output PNG path")]
        output: PathBuf,

        #[arg(long, help = "Viewport width")]
        width: Option<u32>,

        #[arg(long, help = "Viewport height")]
        height: Option<u32>,

        #[arg(long, help = "Capture the viewport only")]
        viewport_only: bool,

        #[arg(long, help = "Skip the autoscroll pass")]
        no_autoscroll: bool,

        #[arg(long, help = "Navigation timeout in milliseconds")]
        timeout_ms: Option<u64>,

        #[arg(long, help = "Forward the capture to this endpoint")]
        notify_api: Option<String>,
    },
    /// Check a configuration file
    Validate {
        #[arg(value_name = "CONFIG")]
        path: PathBuf,
    },
}

pub struct CliRunner {
    pub config: Config,
}

impl CliRunner {
    pub async fn new(args: &Cli) -> anyhow::Result<Self> {
        let config = load_config(args).await?;
        Ok(Self { config })
    }

    pub async fn run(
        &self,
        command: Commands,
        shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        match command {
            Commands::Serve { bind, port } => self.run_server(bind, port, shutdown).await,
            Commands::Capture {
                url,
                output,
                width,
                height,
                viewport_only,
                no_autoscroll,
                timeout_ms,
                notify_api,
            } => {
                let defaults = ScrapeRequest::default();
                let request = ScrapeRequest {
                    url,
                    notify_api,
                    full_page: !viewport_only,
                    autoscroll: !no_autoscroll,
                    viewport_width: width.unwrap_or(defaults.viewport_width),
                    viewport_height: height.unwrap_or(defaults.viewport_height),
                    timeout_ms: timeout_ms.unwrap_or(defaults.timeout_ms),
                    ..defaults
                };
                self.run_capture(request, output).await
            }
            Commands::Validate { path } => self.validate_config(path).await,
        }
    }

    pub async fn run_server(
        &self,
        bind: Option<String>,
        port: Option<u16>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let addr = resolve_bind(&self.config.bind, bind.as_deref(), port)?;

        let service = Arc::new(CaptureService::new(self.config.clone()));
        let notifier = Notifier::new(self.config.notify.clone())?;
        let mut state = AppState::new(service, notifier, self.config.max_concurrent_captures);

        match install_prometheus_recorder() {
            Ok(handle) => state = state.with_prometheus(handle),
            Err(e) => warn!("Metrics endpoint disabled: {}", e),
        }

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;

        info!("Starting server on {}", addr);
        run_server(listener, state, async move {
            let _ = shutdown.recv().await;
        })
        .await?;

        info!("Server stopped");
        Ok(())
    }

    pub async fn run_capture(&self, request: ScrapeRequest, output: PathBuf) -> anyhow::Result<()> {
        info!("Taking screenshot of: {}", request.url);

        let service = CaptureService::new(self.config.clone());
        let result = service.capture_page(&request).await?;
        let png = decode_base64(&result.screenshot_base64)?;

        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&output, &png).await?;
        info!("Screenshot saved to: {}", output.display());

        println!("Screenshot captured successfully:");
        println!("  URL: {}", request.url);
        println!("  Final URL: {}", result.final_url);
        println!("  Title: {}", result.title);
        println!("  Output: {}", output.display());
        println!("  Size: {} bytes", png.len());
        println!("  Full page: {}", result.full_page);
        if let Ok((width, height)) = png_dimensions(&png) {
            println!("  Dimensions: {width}x{height}");
        }

        if let Some(target) = &request.notify_api {
            let notifier = Notifier::new(self.config.notify.clone())?;
            match notifier
                .send(target, &result.screenshot_base64, Some(result.notify_meta(&request.url)))
                .await
            {
                Ok(outcome) => println!(
                    "  Notified: {} (status {})",
                    outcome.target_api, outcome.status_code
                ),
                Err(e) => println!("  Notify failed: {e}"),
            }
        }

        Ok(())
    }

    pub async fn validate_config(&self, config_path: PathBuf) -> anyhow::Result<()> {
        println!("Validating configuration: {}", config_path.display());

        let config = Config::load(&config_path).await?;

        println!("Configuration is valid:");
        println!("  Bind: {}", config.bind);
        println!("  Max concurrent captures: {}", config.max_concurrent_captures);
        println!("  Settle delay: {:?}", config.settle_delay);
        println!("  Asset wait timeout: {:?}", config.asset_wait_timeout);
        println!("  Viewport fallback: {}", config.viewport_fallback);
        println!(
            "  Autoscroll: {}px steps, {} max rounds, {} stable rounds",
            config.autoscroll.step_px, config.autoscroll.max_rounds, config.autoscroll.stable_rounds
        );
        println!("  Notify timeout: {:?}", config.notify.timeout);

        Ok(())
    }
}

/// Read the configuration file if one was given and apply CLI overrides.
pub async fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .await
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(chrome_path) = &args.chrome_path {
        config.chrome_path = Some(chrome_path.clone());
    }

    if let Some(max_concurrent) = args.max_concurrent {
        config.max_concurrent_captures = max_concurrent;
    }

    config.validate()?;

    info!("Configuration loaded successfully");
    info!("Max concurrent captures: {}", config.max_concurrent_captures);

    Ok(config)
}

/// Combine the configured bind address with `--bind` and `--port`.
pub fn resolve_bind(
    configured: &str,
    bind: Option<&str>,
    port: Option<u16>,
) -> anyhow::Result<SocketAddr> {
    let raw = bind.unwrap_or(configured);
    let mut addr: SocketAddr = match raw.parse() {
        Ok(addr) => addr,
        Err(e) => bail!("invalid bind address {raw}: {e}"),
    };

    if let Some(port) = port {
        addr.set_port(port);
    }

    Ok(addr)
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_override_and_port() {
        assert_eq!(
            resolve_bind("127.0.0.1:8000", None, None).unwrap(),
            "127.0.0.1:8000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            resolve_bind("127.0.0.1:8000", Some("0.0.0.0:9000"), None).unwrap(),
            "0.0.0.0:9000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            resolve_bind("127.0.0.1:8000", None, Some(3000)).unwrap(),
            "127.0.0.1:3000".parse::<SocketAddr>().unwrap()
        );
        assert!(resolve_bind("localhost", None, None).is_err());
    }

    #[test]
    fn capture_command_parses() {
        let cli = Cli::parse_from([
            "webshot-relay",
            "--verbose",
            "capture",
            "--url",
            "https://example.com",
            "--output",
            "shot.png",
            "--viewport-only",
            "--width",
            "800",
        ]);

        assert!(cli.verbose);
        match cli.command {
            Commands::Capture {
                url,
                viewport_only,
                width,
                height,
                ..
            } => {
                assert_eq!(url, "https://example.com");
                assert!(viewport_only);
                assert_eq!(width, Some(800));
                assert_eq!(height, None);
            }
            _ => panic!("expected capture command"),
        }
    }

    #[test]
    fn validate_path_is_not_the_global_config() {
        let cli = Cli::parse_from(["webshot-relay", "validate", "broken.json"]);

        assert!(cli.config.is_none());
        match cli.command {
            Commands::Validate { path } => assert_eq!(path, PathBuf::from("broken.json")),
            _ => panic!("expected validate command"),
        }
    }

    #[tokio::test]
    async fn validate_reports_a_broken_file_itself() {
        let path = std::env::temp_dir().join(format!("webshot-relay-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{ "max_concurrent_captures": 0 }"#).unwrap();

        let cli = Cli::parse_from([
            std::ffi::OsStr::new("webshot-relay"),
            std::ffi::OsStr::new("validate"),
            path.as_os_str(),
        ]);
        let runner = CliRunner::new(&cli).await.unwrap();
        let (_tx, rx) = broadcast::channel(1);
        let result = runner.run(cli.command, rx).await;
        std::fs::remove_file(&path).unwrap();

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cli_overrides_apply_to_defaults() {
        let cli = Cli::parse_from([
            "webshot-relay",
            "--max-concurrent",
            "9",
            "--chrome-path",
            "/opt/chrome",
            "serve",
        ]);

        let config = load_config(&cli).await.unwrap();
        assert_eq!(config.max_concurrent_captures, 9);
        assert_eq!(config.chrome_path.as_deref(), Some("/opt/chrome"));
    }
}
