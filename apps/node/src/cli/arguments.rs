use std::path::PathBuf;

use clap::Parser;

/// Run the node.
#[derive(Parser, Debug)]
pub struct Run {
    /// Path to the node's configuration file.
    #[clap(short, long)]
    pub config: PathBuf,
}
