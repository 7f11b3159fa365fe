use std::net::IpAddr;
use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(
    name = "edgesocks",
    about = "SOCKS5 agent that relays node-addressed connections through the edge mesh"
)]
pub struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the SOCKS5 proxy and serve until Ctrl-C
    Run(RunArgs),
    /// Validate configuration and check that the listener can bind
    Check(ConfigSource),
    /// Manage edgesocks configuration
    Config(ConfigArgs),
}

/// Where configuration comes from.
#[derive(Args, Clone, Default)]
pub struct ConfigSource {
    /// Load an additional config file on top of the layered ones
    #[arg(long = "config", value_name = "PATH")]
    pub extra_config: Option<PathBuf>,

    /// Ignore the global and project config files
    #[arg(long)]
    pub no_config: bool,
}

#[derive(Args)]
pub struct RunArgs {
    /// Address to listen on (overrides socks5.listen_ip)
    #[arg(long, value_name = "IP")]
    pub listen_ip: Option<IpAddr>,

    /// Port to listen on (overrides socks5.listen_port)
    #[arg(long, short = 'p', value_name = "PORT")]
    pub port: Option<u16>,

    /// Name of the node this agent runs on (overrides socks5.node_name and $NODE_NAME)
    #[arg(long, value_name = "NAME")]
    pub node_name: Option<String>,

    #[command(flatten)]
    pub source: ConfigSource,
}

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub subcommand: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Write a starter config file
    Init {
        /// Write the global config instead of the one in the current directory
        #[arg(long)]
        global: bool,
    },
    /// Print the effective merged configuration
    Show {
        #[arg(long, value_enum, default_value = "toml")]
        format: OutputFormat,

        #[command(flatten)]
        source: ConfigSource,
    },
}

#[derive(ValueEnum, Clone, Copy)]
pub enum OutputFormat {
    Toml,
    Json,
}
