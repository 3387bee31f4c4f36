use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use super::commands::{
    ask::AskArgs, check::CheckArgs, contexts::ContextsArgs, schema::SchemaArgs,
};

#[derive(Debug, Parser)]
#[command(
    name = "quarry",
    version,
    about = "Governed natural-language questions over a read-only database"
)]
pub struct Cli {
    #[command(flatten)]
    pub runtime: RuntimeArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Args)]
pub struct RuntimeArgs {
    #[arg(long, global = true, value_name = "PATH")]
    pub home_dir: Option<PathBuf>,

    #[arg(long, global = true, value_name = "PATH")]
    pub cwd: Option<PathBuf>,

    #[arg(long, global = true, value_name = "PATH")]
    pub database: Option<PathBuf>,

    #[arg(long, global = true, value_name = "PATH")]
    pub catalog: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Ask(AskArgs),
    Schema(SchemaArgs),
    Check(CheckArgs),
    Contexts(ContextsArgs),
}
