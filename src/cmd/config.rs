//! Configuration view and validation commands, `agentdeck config`.

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use agentdeck::config::{AgentdeckConfig, AgentdeckToml, CONFIG_DIR, CONFIG_FILE};

    let config_dir = project_dir.join(CONFIG_DIR);
    let config_path = config_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("agentdeck configuration");
            println!("=======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No agentdeck.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            let toml = AgentdeckToml::load_or_default(&config_dir)?;
            print_toml(&toml);

            let config = AgentdeckConfig::new(project_dir.to_path_buf())?;
            println!("Effective values (with env/CLI overrides):");
            println!("  listen = \"{}:{}\"", config.host(), config.port());
            println!("  db_path = \"{}\"", config.db_path().display());
            println!("  agent command = \"{}\"", config.agent_command());
            println!();

            if !config_path.exists() {
                println!("Run 'agentdeck config init' to create an agentdeck.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No agentdeck.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = AgentdeckToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
                println!();
                anyhow::bail!("{} configuration warning(s)", warnings.len());
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("agentdeck.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config_dir)?;
            AgentdeckToml::default().save(&config_path)?;

            println!("Created agentdeck.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] port, host, db_path");
            println!("  - [agent] command, default_model, allowed_tools");
            println!("  - [logging] level, format, directory");
            println!();
        }
    }

    Ok(())
}

fn print_toml(toml: &agentdeck::config::AgentdeckToml) {
    println!("[server]");
    println!("  port = {}", toml.server.port);
    println!("  host = \"{}\"", toml.server.host);
    println!("  db_path = \"{}\"", toml.server.db_path.display());
    println!("  dev_mode = {}", toml.server.dev_mode);
    println!();

    println!("[agent]");
    if let Some(command) = &toml.agent.command {
        println!("  command = \"{}\"", command);
    }
    println!("  default_model = \"{}\"", toml.agent.default_model);
    if !toml.agent.allowed_tools.is_empty() {
        println!("  allowed_tools = {:?}", toml.agent.allowed_tools);
    }
    if !toml.agent.disallowed_tools.is_empty() {
        println!("  disallowed_tools = {:?}", toml.agent.disallowed_tools);
    }
    println!("  thinking_tokens = {}", toml.agent.thinking_tokens);
    println!("  history_limit = {}", toml.agent.history_limit);
    if let Some(secs) = toml.agent.turn_timeout_secs {
        println!("  turn_timeout_secs = {}", secs);
    }
    println!();

    println!("[gateway]");
    println!("  subscriber_buffer = {}", toml.gateway.subscriber_buffer);
    println!();

    println!("[logging]");
    println!("  level = \"{}\"", toml.logging.level);
    println!("  format = \"{:?}\"", toml.logging.format);
    if let Some(dir) = &toml.logging.directory {
        println!("  directory = \"{}\"", dir.display());
    }
    println!();
}
