//! keyshred CLI - Destroy a file or block device by encrypting it in place
//!
//! The key and IV are printed once on stdout and then wiped from memory.
//! Everything else (prompts, logs, the summary) goes to stderr.

use anyhow::Result;
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

use keyshred::confirm::{
    self, ConfirmationReader, ReaderConfirmationReader, TerminalConfirmationReader,
};
use keyshred::{SessionConfig, TargetKind, mounts};

#[derive(Parser)]
#[command(name = "keyshred")]
#[command(version)]
#[command(about = "Encrypt a file or device in place with a key you see once.", long_about = None)]
struct Cli {
    /// File or block device to destroy
    #[arg(value_name = "TARGET")]
    target: PathBuf,

    /// Log more (-v for progress, -vv for every state change)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Read the device confirmation from stdin instead of from the terminal
    #[arg(long)]
    confirm_stdin: bool,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = execute(&cli) {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn execute(cli: &Cli) -> Result<()> {
    let mut session = keyshred::begin_session(&cli.target, SessionConfig::default())?;

    if session.kind() == TargetKind::BlockDevice {
        mounts::check_system(&cli.target).ensure_unmounted(&cli.target)?;
        let mut reader = get_confirmation_reader(cli.confirm_stdin);
        confirm::confirm_destruction(&mut *reader, &cli.target)?;
        session.confirm_device();
    }

    match session.run() {
        Ok(report) => {
            eprintln!(
                "keyshred: encrypted {} bytes of {} {} ({} bytes now on disk)",
                report.bytes_processed,
                report.kind,
                cli.target.display(),
                report.output_len
            );
            if !report.memory_pinned {
                eprintln!("keyshred: warning: the key could not be locked in memory");
            }
            Ok(())
        }
        Err(err) => {
            if err.bytes_processed > 0 {
                eprintln!(
                    "keyshred: the first {} bytes of {} were encrypted; the rest is unchanged",
                    err.bytes_processed,
                    cli.target.display()
                );
            }
            Err(err.into())
        }
    }
}

fn get_confirmation_reader(use_stdin: bool) -> Box<dyn ConfirmationReader> {
    if use_stdin {
        Box::new(ReaderConfirmationReader::new(Box::new(std::io::stdin())))
    } else {
        Box::new(TerminalConfirmationReader)
    }
}
