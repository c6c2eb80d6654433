pub mod arborist_cli;
pub mod build_info;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod events;
pub mod logfile;
pub mod registry;
pub mod rpc;
pub mod tree;
pub mod watcher;
