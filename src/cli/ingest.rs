use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;
use tokio::task::block_in_place;

use crate::cli::SubCommandExtend;
use crate::config::{ExtractOptions, TrainOptions};
use crate::corpus;
use crate::feature::SiftExtractor;
use crate::{EngineBuilder, Opts};

#[derive(Parser, Debug, Clone)]
pub struct IngestCommand {
    #[command(flatten)]
    pub extract: ExtractOptions,
    #[command(flatten)]
    pub train: TrainOptions,
    /// 按 <州>/<地点>/<图片> 组织的源目录
    pub src: PathBuf,
    /// 导入后不重建索引
    #[arg(long)]
    pub no_rebuild: bool,
}

impl SubCommandExtend for IngestCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let root = opts.root();
        let mut extractor = SiftExtractor::create(self.extract.clone())?;
        let report = block_in_place(|| corpus::ingest_tree(&mut extractor, &self.src, &root))?;
        println!("created: {}, skipped: {}, failed: {}", report.created, report.skipped, report.failed);

        if report.created > 0 && !self.no_rebuild {
            let engine = EngineBuilder::new(opts.conf_dir.clone())
                .extract(self.extract.clone())
                .train(self.train.clone())
                .open();
            block_in_place(|| engine.rebuild(&root))?;
            info!("索引已更新");
        }
        Ok(())
    }
}
