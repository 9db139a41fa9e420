use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use tokio::task::block_in_place;

use crate::cli::SubCommandExtend;
use crate::config::{ExtractOptions, TrainOptions};
use crate::{EngineBuilder, Opts, RebuildReport};

#[derive(Parser, Debug, Clone)]
pub struct RebuildCommand {
    #[command(flatten)]
    pub extract: ExtractOptions,
    #[command(flatten)]
    pub train: TrainOptions,
}

impl SubCommandExtend for RebuildCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let engine = EngineBuilder::new(opts.conf_dir.clone())
            .extract(self.extract.clone())
            .train(self.train.clone())
            .open();
        let root = opts.root();
        info!("开始重建索引: {}", root.display());
        match block_in_place(|| engine.rebuild(&root))? {
            RebuildReport::Built(stats) => {
                info!("构建索引成功");
                println!(
                    "references: {}, extracted: {}, skipped: {}",
                    stats.references, stats.extracted, stats.failed
                );
            }
            RebuildReport::NoVocabulary(stats) => {
                warn!("没有可用的参考图片，索引未更新");
                println!("no usable vocabulary ({} images found)", stats.images);
            }
        }
        Ok(())
    }
}
