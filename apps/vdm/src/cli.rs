use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "vdm", about = "LLM API gateway", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the gateway server (the default when no command is given).
    Serve {
        /// Listen address; overrides HOST.
        #[arg(long)]
        host: Option<String>,
        /// Listen port; overrides PORT.
        #[arg(long)]
        port: Option<u16>,
    },
}
