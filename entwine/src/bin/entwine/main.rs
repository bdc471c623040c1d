mod commands;
mod context;
mod help;
mod output;
mod theme;

use anyhow::Result;
use clap::{FromArgMatches, Parser, Subcommand, error::ErrorKind};
use std::io::{self, Write};

use commands::{
    commit::{CommitArgs, handle_commit},
    schema::{SchemaCommands, handle_schema_commands},
};
use output::{GlobalOptions, OutputFormat, OutputManager};

#[derive(Parser)]
#[command(name = "entwine", version)]
#[command(
    about = "Commit nested entity graphs atomically",
    long_about = r#"Entwine commits nested document graphs to Redis in one atomic transaction.

Commands:
  schema    Validate a schema file and summarize its kinds
  commit    Resolve and commit document trees
"#
)]
#[command(subcommand_required = true, arg_required_else_help = true)]
struct Cli {
    /// Output format
    #[arg(long, value_enum, default_value = "table")]
    output: OutputFormat,

    /// Suppress output (only errors will be shown)
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Enable verbose output
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a schema file and summarize its kinds
    #[command(subcommand)]
    Schema(SchemaCommands),

    /// Resolve and commit document trees in one transaction
    Commit(CommitArgs),
}

impl Cli {
    fn parse_or_exit() -> Self {
        help::command()
            .try_get_matches()
            .and_then(|matches| Cli::from_arg_matches(&matches))
            .unwrap_or_else(|err| usage_exit(err))
    }

    fn global_options(&self) -> GlobalOptions {
        GlobalOptions {
            output_format: self.output.clone(),
            quiet: self.quiet,
            verbose: self.verbose,
            no_color: self.no_color,
        }
    }
}

/// Writes a blank line, ignoring a closed pipe.
fn pad(mut stream: impl Write) {
    let _ = stream.write_all(b"\n").and_then(|()| stream.flush());
}

/// Prints clap's help, version or usage error framed by blank lines and exits.
fn usage_exit(err: clap::error::Error) -> ! {
    let informational = matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion);
    let code = if informational { 0 } else { err.exit_code() };

    if err.kind() == ErrorKind::MissingSubcommand {
        pad(io::stderr());
        eprintln!("error: 'entwine' requires a subcommand but one was not provided");
        pad(io::stderr());
        let _ = help::command().write_long_help(&mut io::stderr());
        pad(io::stderr());
    } else {
        let frame = || if informational { pad(io::stdout()) } else { pad(io::stderr()) };
        frame();
        if let Err(print_err) = err.print()
            && print_err.kind() != io::ErrorKind::BrokenPipe
        {
            eprintln!("Failed to display output: {print_err}");
        }
        frame();
    }
    std::process::exit(code);
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse_or_exit();
    pad(io::stdout());
    let outcome = run(cli).await;
    if let Err(err) = &outcome {
        eprintln!("Error: {err:#}");
    }
    pad(io::stdout());
    if outcome.is_err() {
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let options = cli.global_options();
    if options.no_color {
        colored::control::set_override(false);
    }
    let output = OutputManager::new(options);

    match cli.command {
        Commands::Schema(command) => handle_schema_commands(command, &output).await,
        Commands::Commit(args) => handle_commit(args, &output).await,
    }
}
