use anyhow::Result;
use clap::Parser;

use crate::cli::SubCommandExtend;
use crate::{Opts, corpus};

#[derive(Parser, Debug, Clone)]
pub struct LocationsCommand {}

impl SubCommandExtend for LocationsCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        for location in corpus::list_locations(&opts.root())? {
            println!("{location}");
        }
        Ok(())
    }
}
