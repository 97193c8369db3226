use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};

use crate::config::Config;
use crate::events::AsyncEvent;
use crate::interpreter::OutputStream;
use crate::server;
use crate::service::InteropService;
use crate::session::DebugCommand;

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Tether - drive an embedded interpreter from an IDE", long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default search)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter (overrides config file and env vars)
    #[arg(long, global = true)]
    pub log_filter: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve newline-delimited JSON requests on stdin/stdout
    Serve,

    /// Evaluate a script through the REPL, printing its output
    Run {
        /// Script to evaluate
        file: PathBuf,

        /// Truncation limit for printed values
        #[arg(long)]
        text_limit: Option<usize>,
    },
}

impl Cli {
    /// Load configuration honouring the global flags
    pub fn load_config(&self) -> Result<Config> {
        let text_limit = match &self.command {
            Commands::Run { text_limit, .. } => *text_limit,
            Commands::Serve => None,
        };
        Config::builder()
            .config_path(self.config.clone())
            .log_filter(self.log_filter.clone())
            .text_limit(text_limit)
            .build()
    }
}

/// Run the command described by `cli`. Returns the process exit code.
pub async fn run_cli_with_config(cli: Cli, config: Config) -> Result<i32> {
    match cli.command {
        Commands::Serve => {
            server::serve(config).await?;
            Ok(0)
        }
        Commands::Run { file, .. } => run_script(config, file).await,
    }
}

/// Evaluate `file` at the prompt. Input requests get end of input, debugger
/// stops continue and view requests are released at once.
async fn run_script(config: Config, file: PathBuf) -> Result<i32> {
    let code = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let service = InteropService::start(config)?;
    let mut submitted = false;
    let mut failed = false;

    while let Some(event) = service.next_event().await {
        match event {
            AsyncEvent::Prompt if !submitted => {
                info!(file = %file.display(), "Evaluating script");
                service.repl_execute(code.clone(), Some(file.display().to_string()), false);
                submitted = true;
            }
            AsyncEvent::Prompt => break,
            AsyncEvent::Text { stream, text } => match stream {
                OutputStream::Stdout => print!("{}", text),
                OutputStream::Stderr => eprint!("{}", text),
            },
            AsyncEvent::RequestReadLine { .. } | AsyncEvent::ChildProcessInput => {
                service.send_end_of_input()
            }
            AsyncEvent::DebugPrompt { .. } => service.debug_command(DebugCommand::Continue),
            AsyncEvent::ViewRequest { request_id, title, .. } => {
                eprintln!("View: {}", title);
                service.client_request_finished(request_id);
            }
            AsyncEvent::Exception { .. } => failed = true,
            AsyncEvent::Termination => break,
            AsyncEvent::Busy => debug!("Interpreter busy"),
        }
    }

    service.shutdown().await?;
    Ok(if failed { 1 } else { 0 })
}
