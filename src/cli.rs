use crate::config::env::{self, ProcessEnv, LD_PRELOAD_FILE};
use crate::safety::registry::SessionRegistry;
use crate::session::controller::{SessionController, SessionOptions};
use crate::session::summary::{beep, write_banner, write_json, SessionSummary};
use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

const BEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Interposition library to preload (default: /lib, then next to this binary)
    #[arg(long)]
    lib: Option<PathBuf>,
    /// Shell that runs the protected command
    #[arg(long, default_value = "/bin/bash")]
    shell: PathBuf,
    /// Dynamic linker preload list to register the library in
    #[arg(long, default_value = LD_PRELOAD_FILE)]
    preload_file: PathBuf,
    /// Directory for the violation and debug logs
    #[arg(long, default_value = "/tmp")]
    log_dir: PathBuf,
    /// Print the session summary as JSON instead of the banner
    #[arg(long)]
    json: bool,
    /// List live sessions in the registry and exit
    #[arg(long)]
    list_sessions: bool,
    /// Command to run under protection; an interactive shell when omitted
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

/// Parse arguments, run one session and return the process exit code.
pub fn run() -> Result<i32> {
    env_logger::init();

    let cli = Cli::parse();

    if cli.list_sessions {
        let registry = SessionRegistry::new(
            env::pids_file(&ProcessEnv),
            &cli.preload_file,
            PathBuf::new(),
        );
        let sessions = registry
            .active_sessions()
            .context("reading the session registry")?;
        let mut out = std::io::stdout().lock();
        if cli.json {
            serde_json::to_writer(&mut out, &sessions)?;
            writeln!(out)?;
        } else {
            for pid in sessions {
                writeln!(out, "{}", pid)?;
            }
        }
        return Ok(0);
    }

    let options = SessionOptions {
        lib: cli.lib,
        shell: cli.shell,
        command: cli.command,
        preload_file: cli.preload_file,
        log_dir: cli.log_dir,
    };
    let summary = SessionController::new(options).run()?;
    report(&summary, cli.json)?;
    Ok(summary.exit_code)
}

fn report(summary: &SessionSummary, json: bool) -> Result<()> {
    let mut out = std::io::stdout().lock();
    if json {
        write_json(&mut out, summary)?;
        return Ok(());
    }
    if !summary.log_present {
        return Ok(());
    }

    let log_text = std::fs::read(&summary.log_file)
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default();
    write_banner(&mut out, &summary.log_file, &log_text)?;
    beep(
        &mut std::io::stderr().lock(),
        env::beep_count(&ProcessEnv),
        BEEP_INTERVAL,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn trailing_command_keeps_hyphen_arguments() {
        let cli = Cli::try_parse_from(["sandbox", "--json", "make", "-j4", "install"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.command, vec!["make", "-j4", "install"]);
        assert_eq!(cli.shell, PathBuf::from("/bin/bash"));
        assert_eq!(cli.preload_file, PathBuf::from(LD_PRELOAD_FILE));
    }

    #[test]
    fn no_command_means_interactive() {
        let cli = Cli::try_parse_from(["sandbox", "--log-dir", "/var/log"]).unwrap();
        assert!(cli.command.is_empty());
        assert_eq!(cli.log_dir, PathBuf::from("/var/log"));
    }
}
