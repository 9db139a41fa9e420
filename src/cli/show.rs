use anyhow::Result;
use clap::Parser;
use tokio::task::block_in_place;

use crate::cli::SubCommandExtend;
use crate::config::{ExtractOptions, Opts};
use crate::feature::SiftExtractor;
use crate::utils;

#[derive(Parser, Debug, Clone)]
pub struct ShowCommand {
    #[command(flatten)]
    pub extract: ExtractOptions,
    /// 图片路径
    pub image: String,
    /// 将特征点画出并保存到文件
    pub output: Option<String>,
}

impl SubCommandExtend for ShowCommand {
    async fn run(&self, _opts: &Opts) -> Result<()> {
        block_in_place(|| {
            let mut extractor = SiftExtractor::create(self.extract.clone())?;
            let image = extractor.preprocess(utils::imread(&self.image)?)?;
            let keypoints = extractor.detect(&image)?.map(|f| f.keypoints().to_vec()).unwrap_or_default();
            println!("{}", keypoints.len());

            if let Some(file) = &self.output {
                let output = utils::draw_keypoints(&image, &keypoints)?;
                utils::imwrite(file, &output)?;
            }
            Ok(())
        })
    }
}
