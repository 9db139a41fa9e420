use anyhow::Result;
use clap::Parser;
use log::info;

use crate::cli::SubCommandExtend;
use crate::{EngineBuilder, Opts};

#[derive(Parser, Debug, Clone)]
pub struct CleanCommand {}

impl SubCommandExtend for CleanCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let engine = EngineBuilder::new(opts.conf_dir.clone()).open();
        info!("清理索引文件中……");
        engine.clear()?;
        info!("清理完成");
        Ok(())
    }
}
