//! Serve Command
//!
//! Starts a project's server the same way a scenario would, then keeps it
//! running until Ctrl-C and stops it with the termination policy.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use formprobe_harness::{ScenarioSpec, ServerConfig, ServerLauncher, StopOutcome};
use tracing::info;

use crate::output::{print_info, print_success, print_warning};

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Directory containing the server entrypoint
    #[arg(long, default_value = ".")]
    pub project_dir: PathBuf,

    /// Take the server section from this scenario file
    #[arg(long)]
    pub scenario: Option<PathBuf>,

    /// Port passed to the server as PORT
    #[arg(long)]
    pub port: Option<u16>,

    /// Server command, overriding the configured program and args
    #[arg(last = true)]
    pub command: Vec<String>,
}

/// Returns false when the server exited by itself instead of being stopped.
pub async fn execute(args: ServeArgs) -> Result<bool> {
    let config = server_config(&args)?;
    let launcher = ServerLauncher::new(config);

    info!("Starting server in {}", args.project_dir.display());
    let mut server = launcher
        .start(&args.project_dir)
        .await
        .context("Server failed to start")?;

    print_success(&format!("Server ready at {} (pid {})", server.base_url(), server.pid()));
    print_info("Press Ctrl-C to stop");

    let exited_on_its_own = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            false
        }
        exit = server.process().handle().wait() => {
            print_warning(&format!("Server exited on its own ({})", exit));
            true
        }
    };

    match launcher.stop(&mut server).await.context("Failed to stop server")? {
        StopOutcome::Exited {
            exit,
            signals_sent,
            elapsed_ms,
        } => {
            let signals: Vec<&str> = signals_sent.iter().map(|s| s.name()).collect();
            print_success(&format!(
                "Server stopped ({}) after {} in {} ms",
                exit,
                signals.join(" → "),
                elapsed_ms
            ));
        }
        StopOutcome::NotRunning { exit } => print_info(&format!("Server already exited ({})", exit)),
        StopOutcome::AlreadyStopped => {}
    }

    Ok(!exited_on_its_own)
}

fn server_config(args: &ServeArgs) -> Result<ServerConfig> {
    let mut config = match &args.scenario {
        Some(path) => ScenarioSpec::from_file(path)?.server,
        None => ServerConfig::default(),
    };
    if let Some(port) = args.port {
        config.port = Some(port);
    }
    if let Some((program, rest)) = args.command.split_first() {
        config.program = program.clone();
        config.args = rest.to_vec();
    }
    config.validate().map_err(|e| anyhow::anyhow!("invalid server configuration: {}", e))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(command: &[&str]) -> ServeArgs {
        ServeArgs {
            project_dir: PathBuf::from("."),
            scenario: None,
            port: Some(8123),
            command: command.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_command_overrides_program() {
        let config = server_config(&args(&["npm", "run", "dev"])).unwrap();
        assert_eq!(config.program, "npm");
        assert_eq!(config.args, vec!["run".to_string(), "dev".to_string()]);
        assert_eq!(config.port, Some(8123));
    }

    #[test]
    fn test_defaults_without_command() {
        let config = server_config(&args(&[])).unwrap();
        assert_eq!(config.program, "node");
        assert_eq!(config.args, vec!["server.js".to_string()]);
    }

    #[test]
    fn test_server_section_from_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.yaml");
        std::fs::write(
            &path,
            r##"
name: echo
server:
  program: cargo
  args: [run, -p, formprobe-echo]
form:
  url: /
  fields: []
  submit_selector: "#go"
  success_indicator:
    text_on_page: Done
"##,
        )
        .unwrap();

        let mut serve = args(&[]);
        serve.scenario = Some(path);
        let config = server_config(&serve).unwrap();
        assert_eq!(config.program, "cargo");
        assert_eq!(config.port, Some(8123));
    }
}
