use std::path::{Path, PathBuf};

use edgesocks_settings::{AgentConfig, ConfigLoader};

use crate::agent;
use crate::cli::{ConfigArgs, ConfigSource, ConfigSubcommand, OutputFormat};
use crate::error::CliError;

pub async fn config(args: ConfigArgs, cwd: PathBuf) -> Result<(), CliError> {
    match args.subcommand {
        ConfigSubcommand::Init { global } => init(global, &cwd),
        ConfigSubcommand::Show { format, source } => show(format, &source, &cwd),
    }
}

fn init(global: bool, cwd: &Path) -> Result<(), CliError> {
    let path = if global {
        ConfigLoader::global_config_path()
    } else {
        ConfigLoader::project_config_path(cwd)
    };

    if path.exists() {
        return Err(CliError::Other(format!(
            "Config file already exists: {}",
            path.display()
        )));
    }

    AgentConfig::starter().save(&path)?;
    println!("Created config: {}", path.display());
    Ok(())
}

fn show(format: OutputFormat, source: &ConfigSource, cwd: &Path) -> Result<(), CliError> {
    let config = agent::load_config(source, cwd)?;
    match format {
        OutputFormat::Toml => {
            let toml = config.to_toml()?;
            print!("{toml}");
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&config)
                .map_err(|e| CliError::Other(format!("JSON serialization failed: {e}")))?;
            println!("{json}");
        }
    }
    Ok(())
}
