//! Configuration view and validation commands: `reconflow config`.

use anyhow::Result;
use console::style;
use reconflow::config::{ReconConfig, ReconToml};
use reconflow::stage::StageKind;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = project_dir.join(reconflow::config::CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Reconflow Configuration");
            println!("=======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No reconflow.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            let config = ReconConfig::new(project_dir.to_path_buf())?;
            let toml = &config.toml;

            println!("[retry]");
            println!("  max_attempts = {}", toml.retry.max_attempts);
            println!("  base_delay_ms = {}", toml.retry.base_delay_ms);
            println!("  max_delay_ms = {}", toml.retry.max_delay_ms);
            println!();

            println!("[stages]");
            for kind in StageKind::ALL {
                let policy = toml.stage_policy(kind);
                let tool = toml.tool_spec(kind);
                println!(
                    "  {:<22} timeout {}s, {} attempts, batch {}: {}",
                    kind.as_str(),
                    policy.timeout.as_secs(),
                    policy.max_attempts,
                    tool.batch_size,
                    style(tool.display()).dim()
                );
            }
            println!();

            println!("Profiles: {}", config.toml.pipelines().names().join(", "));
            println!();

            // Effective values include env and CLI overrides
            println!("Effective values (with env/CLI overrides):");
            println!("  workers = {}", config.workers());
            println!("  journal = {}", config.journal_path().display());
            println!("  log format = {}", toml.logging.format);
            match config.log_dir() {
                Some(dir) => println!("  log dir = {}", dir.display()),
                None => println!("  log dir = (stderr only)"),
            }
            match config.webhook_url() {
                Some(url) => println!("  webhook_url = \"{}\"", url),
                None => println!("  webhook_url = (alerts logged only)"),
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No reconflow.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = ReconToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("reconflow.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            ReconToml::default().save(&config_path)?;

            println!("Created reconflow.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [workers] size");
            println!("  - [retry] max_attempts, base_delay_ms, max_delay_ms");
            println!("  - [stages.<stage>] timeout_secs, max_attempts, command, batch_size");
            println!("  - [profiles.<name>] stages, edges");
            println!("  - [alerts] webhook_url");
            println!();
        }
    }

    Ok(())
}
