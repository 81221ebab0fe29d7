// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use clap::Parser;
use covered::cli::{run, setup_logger, Cli};

fn main() -> anyhow::Result<()> {
    setup_logger();
    let cli = Cli::parse();
    run(cli)
}
