use std::env;
use std::fs;
use std::io::{self, IsTerminal, Read, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::{LevelFilter, debug, info, warn};
use serde_json::Value;
use tokio::net::TcpListener;

use llamapod::api;
use llamapod::job::JobHandler;
use llamapod::proxy::CompletionProxy;
use llamapod::{Initializer, Runner, Settings};

const APP_NAME: &str = "llamapod";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Completions { shell } = cli.command {
        return handle_completions(shell);
    }

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("effective settings: {:#?}", ctx.settings.redacted());

    match cli.command {
        Command::Serve(cmd) => async_serve(ctx, cmd),
        Command::RunJob(cmd) => async_run_job(ctx, cmd),
        Command::RenderConfig => async_render_config(ctx),
        Command::Settings => handle_settings(&ctx),
        Command::Completions { .. } => Ok(()),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Llamapod - serverless worker for llama_cpp.server.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// TOML file with settings (environment variables still take precedence)
    #[arg(long, value_name = "PATH", env = "LLAMAPOD_CONFIG", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -v)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Emit logs as JSON lines
    #[arg(long = "json-logs", global = true)]
    json_logs: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Include targets, files and line numbers in log lines
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start llama_cpp.server and serve jobs over HTTP
    Serve(ServeCommand),
    /// Start llama_cpp.server, run a single job and exit
    RunJob(RunJobCommand),
    /// Write the llama_cpp.server config document and print it
    RenderConfig,
    /// Print the effective settings (secrets masked)
    Settings,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address for the job API
    #[arg(long, env = "LLAMAPOD_API_HOST", default_value = "0.0.0.0")]
    host: String,
    /// Port for the job API
    #[arg(short, long, env = "LLAMAPOD_API_PORT", default_value = "8000")]
    port: u16,
}

#[derive(Debug, Clone, Args)]
struct RunJobCommand {
    /// Job document to run (`-` reads stdin)
    #[arg(long, value_name = "PATH", default_value = "test_input.json")]
    input: PathBuf,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    settings: Settings,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let settings = Settings::load(common.config.as_deref()).context("loading settings")?;
        Ok(Self { common, settings })
    }

    /// Install the tracing subscriber (text or JSON on stderr). `log`
    /// records from the library are bridged into it.
    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

        let level = self.effective_log_level();
        log::set_max_level(level);

        let level = level.as_str().to_ascii_lowercase();
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{APP_NAME}={level},llamapod_protocol={level},tower_http={level}"
            ))
        });

        let diagnostics = self.common.diagnostics;
        let json_layer = self
            .common
            .json_logs
            .then(|| fmt::layer().json().with_writer(io::stderr));
        let text_layer = (!self.common.json_logs).then(|| {
            fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(self.use_color())
                .with_target(diagnostics)
                .with_file(diagnostics)
                .with_line_number(diagnostics)
        });

        tracing_subscriber::registry()
            .with(env_filter)
            .with(json_layer)
            .with(text_layer)
            .try_init()
            .ok();

        // No-op once the subscriber owns the `log` facade.
        env_logger::Builder::new()
            .filter_level(self.effective_log_level())
            .try_init()
            .ok();

        Ok(())
    }

    fn use_color(&self) -> bool {
        match self.common.color {
            _ if self.common.no_color || env::var_os("NO_COLOR").is_some() => false,
            ColorOption::Never => false,
            ColorOption::Always => true,
            ColorOption::Auto => env::var_os("FORCE_COLOR").is_some() || io::stderr().is_terminal(),
        }
    }

    fn effective_log_level(&self) -> LevelFilter {
        let common = &self.common;
        if common.quiet {
            return LevelFilter::Error;
        }
        if common.trace || common.verbose >= 2 {
            return LevelFilter::Trace;
        }
        if common.debug || common.verbose == 1 {
            return LevelFilter::Debug;
        }
        LevelFilter::Info
    }
}

#[tokio::main]
async fn async_serve(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let Some(runner) = start_runner_or_shutdown(&ctx.settings).await? else {
        return Ok(());
    };
    let served = serve_jobs(&runner, &cmd).await;

    info!("Stopping llama_cpp.server...");
    if let Err(e) = runner.shutdown().await {
        warn!("Error during shutdown: {:?}", e);
    }
    info!("Shutdown complete");

    served
}

async fn serve_jobs(runner: &Runner, cmd: &ServeCommand) -> Result<()> {
    let state = api::AppState::new(runner.state()).context("building completion client")?;
    let app = api::create_router(state);

    let addr: SocketAddr = format!("{}:{}", cmd.host, cmd.port)
        .parse()
        .with_context(|| format!("parsing listen address {}:{}", cmd.host, cmd.port))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding job API to {addr}"))?;
    info!("Job API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running job API")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

#[tokio::main]
async fn async_run_job(ctx: RuntimeContext, cmd: RunJobCommand) -> Result<()> {
    let raw = read_job(&cmd.input)?;
    let Some(runner) = start_runner_or_shutdown(&ctx.settings).await? else {
        return Ok(());
    };

    let output = match CompletionProxy::new(runner.state()) {
        Ok(proxy) => Ok(JobHandler::new(proxy).handle_value(raw).await),
        Err(e) => Err(e),
    };

    if let Err(e) = runner.shutdown().await {
        warn!("Error during shutdown: {:?}", e);
    }

    let output = output.context("building completion client")?;
    let rendered = serde_json::to_string_pretty(&output).context("serializing job output")?;
    println!("{rendered}");
    Ok(())
}

fn read_job(path: &Path) -> Result<Value> {
    let body = if path == Path::new("-") {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("reading job from stdin")?;
        buffer
    } else {
        fs::read_to_string(path).with_context(|| format!("reading job file {}", path.display()))?
    };
    serde_json::from_str(&body).context("parsing job document")
}

#[tokio::main]
async fn async_render_config(ctx: RuntimeContext) -> Result<()> {
    let document = Initializer::new(&ctx.settings)
        .write_server_config()
        .await
        .context("writing server config")?;
    info!("Wrote {}", ctx.settings.config_path().display());
    let rendered = document
        .redacted()
        .to_json_pretty()
        .context("serializing server config")?;
    println!("{rendered}");
    Ok(())
}

/// Bring the runner up unless a shutdown signal arrives first. Dropping the
/// in-flight bring-up kills the server's process group.
async fn start_runner_or_shutdown(settings: &Settings) -> Result<Option<Runner>> {
    tokio::select! {
        runner = start_runner(settings) => runner.map(Some),
        () = shutdown_signal() => {
            warn!("Shutdown requested during initialization, aborting");
            Ok(None)
        }
    }
}

async fn start_runner(settings: &Settings) -> Result<Runner> {
    let runner = Initializer::new(settings)
        .initialize()
        .await
        .context("initializing llama.cpp runner")?;
    info!("Runner ready (llama_cpp.server PID {})", runner.pid());
    Ok(runner)
}

fn handle_settings(ctx: &RuntimeContext) -> Result<()> {
    let rendered =
        toml::to_string_pretty(&ctx.settings.redacted()).context("serializing settings to TOML")?;
    print!("{rendered}");
    Ok(())
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}
