use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "pine", version, about = "single-node service supervisor")]
pub struct Args {
    /// Directory holding tree definition files
    #[arg(short = 'd', long = "tree-dir", default_value = "/usr/local/etc/forest.d")]
    pub tree_dir: PathBuf,

    /// Unix socket endpoint for the control plane
    #[arg(short = 'e', long = "endpoint", default_value = "/var/run/pine.sock")]
    pub endpoint: PathBuf,

    /// Run trees as the invoking user instead of the configured default
    #[arg(long = "unprivileged")]
    pub unprivileged: bool,
}
