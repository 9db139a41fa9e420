use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::Parser;
use log::{info, warn};
use tokio::task::block_in_place;

use crate::cli::SubCommandExtend;
use crate::config::{ExtractOptions, TrainOptions};
use crate::corpus::{self, IngestOutcome};
use crate::feature::SiftExtractor;
use crate::{EngineBuilder, Opts};

#[derive(Parser, Debug, Clone)]
pub struct AddCommand {
    #[command(flatten)]
    pub extract: ExtractOptions,
    #[command(flatten)]
    pub train: TrainOptions,
    /// 新海龟的参考图片
    pub image: PathBuf,
    /// 海龟所在的 州/地点，例：Kansas/Karlyle
    #[arg(short, long, value_name = "STATE/LOCATION")]
    pub location: String,
    /// 海龟 ID，默认取文件名前 4 个字符
    #[arg(short, long, value_name = "ID")]
    pub turtle_id: Option<String>,
    /// 添加后不重建索引
    #[arg(long)]
    pub no_rebuild: bool,
}

impl SubCommandExtend for AddCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let turtle_id = match &self.turtle_id {
            Some(id) => id.clone(),
            None => self
                .image
                .file_name()
                .and_then(|name| corpus::turtle_id_from_filename(&name.to_string_lossy()))
                .ok_or_else(|| anyhow!("无法从文件名提取海龟 ID: {}", self.image.display()))?,
        };
        let root = opts.root();
        let location_dir = root.join(&self.location);

        let mut extractor = SiftExtractor::create(self.extract.clone())?;
        let outcome =
            block_in_place(|| corpus::ingest_reference(&mut extractor, &self.image, &location_dir, &turtle_id))?;
        match outcome {
            IngestOutcome::Created => println!("created {turtle_id}"),
            IngestOutcome::Skipped => println!("skipped {turtle_id}"),
            IngestOutcome::Failed => {
                warn!("图片没有可用的特征: {}", self.image.display());
                println!("failed {turtle_id}");
                return Ok(());
            }
        }

        if outcome == IngestOutcome::Created && !self.no_rebuild {
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
