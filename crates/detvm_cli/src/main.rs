use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, DecompileCommand, DecompileModeCli, TopLevel};

mod cli;

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Some(TopLevel::Decompile { command }) => match command {
            DecompileCommand::File { path, mode, no_inline } => {
                let mode = match mode {
                    DecompileModeCli::Pseudo => detvm_lib::DecompileMode::Pseudo,
                    DecompileModeCli::Disasm => detvm_lib::DecompileMode::Disasm,
                };
                match std::fs::read(&path) {
                    Ok(bytes) => match detvm_lib::decompile_with_options(
                        &bytes,
                        detvm_lib::DecompileOptions {
                            mode,
                            inline: !no_inline,
                        },
                    ) {
                        Ok(out) => {
                            print!("{out}");
                        }
                        Err(e) => {
                            eprintln!("decompile error: {e}");
                            std::process::exit(1);
                        }
                    },
                    Err(e) => {
                        eprintln!("failed to read {path:?}: {e}");
                        std::process::exit(1);
                    }
                }
            }
        },
        Some(TopLevel::Completion { shell }) => {
            let mut cmd = Cli::command();
            let bin_name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, bin_name, &mut std::io::stdout());
        }
        None => {
            Cli::command().print_help().unwrap();
        }
    }
}
