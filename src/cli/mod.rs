// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Command-line entry points for running a node in either role.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cloud::CloudNode;
use crate::config::{CloudConfig, EdgeConfig};
use crate::edge::EdgeNode;

#[derive(Parser)]
#[command(name = "covered", version, about = "Distributed cooperative edge cache node")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run an edge node.
    Edge {
        /// Path to the TOML config; defaults are used when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Run the origin (cloud) node.
    Cloud {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

/// Initialize logging once; `RUST_LOG` overrides the default filter.
pub fn setup_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

pub fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Edge { config } => {
            let config = match config {
                Some(path) => EdgeConfig::load(&path)
                    .with_context(|| format!("loading edge config {}", path.display()))?,
                None => EdgeConfig::default(),
            };
            let node = EdgeNode::new(config)?;
            node.run()?;
        }
        Command::Cloud { config } => {
            let config = match config {
                Some(path) => CloudConfig::load(&path)
                    .with_context(|| format!("loading cloud config {}", path.display()))?,
                None => CloudConfig::default(),
            };
            CloudNode::new(config).run()?;
        }
    }
    Ok(())
}
