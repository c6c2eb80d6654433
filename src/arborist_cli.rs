use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::rpc::{self, Request, Response};
use crate::{build_info, config};

#[derive(Debug, Parser)]
#[command(name = "arborist", version, about = "pine control client")]
pub struct Args {
    /// Unix socket endpoint of the pine daemon
    #[arg(short = 'e', long = "endpoint", default_value = "/var/run/pine.sock")]
    pub endpoint: PathBuf,

    /// Request timeout, e.g. 10s or 500ms
    #[arg(short = 't', long = "timeout", default_value = "10s")]
    pub timeout: String,

    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Start a tree
    Start { name: String },
    /// Stop a tree
    Stop { name: String },
    /// Restart a tree (refused when its policy is `never`)
    Restart { name: String },
    /// Rotate a tree's log file now
    Logrotate { name: String },
    /// Show status for one tree
    Status {
        name: String,
        /// Output format: text (default) or json
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Show status for every tree
    List {
        /// Output format: text (default) or json
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Print local build info
    Version,
    /// Print the daemon's build info
    ServerVersion,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

pub fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    if matches!(args.cmd, Cmd::Version) {
        println!("{}", build_info::banner());
        return Ok(());
    }
    let timeout = config::parse_duration(&args.timeout)?;
    let sock = &args.endpoint;

    match args.cmd {
        Cmd::Start { name } => {
            print_message(&rpc::client_call(sock, Request::Start { name }, timeout)?);
        }
        Cmd::Stop { name } => {
            print_message(&rpc::client_call(sock, Request::Stop { name }, timeout)?);
        }
        Cmd::Restart { name } => {
            print_message(&rpc::client_call(sock, Request::Restart { name }, timeout)?);
        }
        Cmd::Logrotate { name } => {
            print_message(&rpc::client_call(sock, Request::RotateLog { name }, timeout)?);
        }
        Cmd::Status { name, format } => {
            let resp = rpc::client_call(sock, Request::Status { name }, timeout)?;
            print_statuses(&resp, format)?;
        }
        Cmd::List { format } => {
            let resp = rpc::client_call(sock, Request::List, timeout)?;
            print_statuses(&resp, format)?;
        }
        Cmd::ServerVersion => {
            print_message(&rpc::client_call(sock, Request::ServerVersion, timeout)?);
        }
        Cmd::Version => unreachable!("handled before the socket call"),
    }
    Ok(())
}

fn print_message(resp: &Response) {
    if !resp.message.trim().is_empty() {
        println!("{}", resp.message.trim_end());
    }
}

fn print_statuses(resp: &Response, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Text => println!("{}", resp.render_text()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(resp)?),
    }
    Ok(())
}
