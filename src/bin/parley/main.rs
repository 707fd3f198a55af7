use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use tracing_subscriber::EnvFilter;

use parley::audio::SystemDevices;
use parley::config::Config;
use parley::error::{ParleyError, Result};
use parley::net::WsConnector;
use parley::session::{SessionController, SessionObserver, SessionState};

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Talk to a conversational model out loud",
    long_about = "Parley runs a live, two-way voice conversation with a conversational \
        model. Microphone audio is captured, encoded, and streamed as it is \
        spoken; synthesized replies are played back without gaps, and when you \
        talk over the model its queued speech is cut off immediately."
)]
struct Cli {
    /// Path to config file
    ///
    /// Defaults to ~/.config/parley/config.yaml if not specified. A missing
    /// default file means built-in defaults are used.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    ///
    /// Sets the log level to debug for the parley crate, showing session
    /// state transitions, dropped frames, and transport details.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a live voice session
    ///
    /// Connects to the configured endpoint, streams the microphone, and
    /// plays the model's replies. Runs until interrupted with Ctrl+C or
    /// until the remote ends the session, then prints a summary.
    Talk {
        /// Read the microphone side from a WAV file instead of a device
        #[arg(long)]
        input_file: Option<PathBuf>,

        /// Prebuilt voice name, overriding the config
        #[arg(long)]
        voice: Option<String>,

        /// System instruction, overriding the config
        #[arg(long)]
        instruction: Option<String>,

        /// Print the session summary as JSON
        #[arg(long)]
        stats: bool,
    },

    /// List available audio input and output devices
    Devices,

    /// Generate shell completions
    ///
    /// Prints a completion script for the given shell to stdout.
    Completions {
        /// Shell to generate completions for (bash, zsh, fish, elvish, powershell)
        shell: Shell,
    },
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(&Config::default_path()),
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("parley=debug,info")
    } else {
        EnvFilter::new("parley=info,warn")
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Devices => run_devices(),
        Command::Completions { shell } => {
            generate(shell, &mut Cli::command(), "parley", &mut std::io::stdout());
            Ok(())
        }
        Command::Talk {
            input_file,
            voice,
            instruction,
            stats,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(voice) = voice {
                config.session.voice = voice;
            }
            if let Some(instruction) = instruction {
                config.session.system_instruction = instruction;
            }
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_talk(config, input_file, stats))
        }
    }
}

fn print_device_list(devices: &[String], default_name: Option<&str>) {
    for (i, name) in devices.iter().enumerate() {
        let marker = if default_name == Some(name.as_str()) {
            " (default)"
        } else {
            ""
        };
        println!("  {}: {name}{marker}", i + 1);
    }
}

fn run_devices() -> Result<()> {
    let inputs = parley::audio::capture::list_input_devices()?;
    let outputs = parley::audio::output::list_output_devices()?;

    println!("Input devices:");
    if inputs.is_empty() {
        println!("  (none)");
    }
    print_device_list(
        &inputs,
        parley::audio::capture::default_input_device_name().as_deref(),
    );

    println!("Output devices:");
    if outputs.is_empty() {
        println!("  (none)");
    }
    print_device_list(
        &outputs,
        parley::audio::output::default_output_device_name().as_deref(),
    );
    Ok(())
}

/// Reports session events through the log.
struct LoggingObserver;

impl SessionObserver for LoggingObserver {
    fn on_open(&mut self) {
        tracing::info!("connected, start talking (Ctrl+C to stop)");
    }

    fn on_close(&mut self) {
        tracing::info!("session closed");
    }

    fn on_error(&mut self, cause: &ParleyError) {
        tracing::error!("{cause}");
    }

    fn on_volume(&mut self, level: f32) {
        tracing::trace!("input level {level:.4}");
    }
}

async fn run_talk(config: Config, input_file: Option<PathBuf>, stats: bool) -> Result<()> {
    if config.session.resolve_api_key().is_none() {
        return Err(ParleyError::Config(format!(
            "no API key: set session.api_key or one of {}",
            parley::config::API_KEY_ENV_VARS.join(", ")
        )));
    }

    let devices = Arc::new(SystemDevices::new(input_file));
    let connector = Arc::new(WsConnector::new(&config));
    let controller =
        SessionController::spawn(config, devices, connector, Box::new(LoggingObserver));

    let mut states = controller.subscribe();
    controller.start_session().await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C, shutting down...");
            controller.stop_session().await?;
        }
        _ = states.wait_for(|s| *s == SessionState::Idle) => {}
    }

    let diagnostics = controller.diagnostics().await?;
    controller.shutdown().await;

    if stats {
        let json = serde_json::to_string_pretty(&diagnostics)
            .map_err(|e| ParleyError::Other(format!("failed to encode diagnostics: {e}")))?;
        println!("{json}");
    } else {
        println!("{diagnostics}");
    }
    Ok(())
}
