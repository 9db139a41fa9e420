use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::cli::SubCommandExtend;
use crate::{Opts, corpus};

#[derive(Parser, Debug, Clone)]
pub struct ObserveCommand {
    /// 观察到的图片
    pub image: PathBuf,
    /// 海龟 ID
    pub turtle_id: String,
    /// 海龟所在的 州/地点，不填则在整个目录中查找
    #[arg(short, long, value_name = "STATE/LOCATION")]
    pub location: Option<String>,
}

impl SubCommandExtend for ObserveCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let dest = corpus::add_observation(&opts.root(), &self.image, &self.turtle_id, self.location.as_deref())?;
        println!("{}", dest.display());
        Ok(())
    }
}
