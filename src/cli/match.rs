use anyhow::Result;
use clap::Parser;
use tokio::task::block_in_place;

use crate::cli::SubCommandExtend;
use crate::config::{ExtractOptions, Opts, SearchOptions};
use crate::feature::SiftExtractor;
use crate::utils;
use crate::verify::SpatialVerifier;

#[derive(Parser, Debug, Clone)]
pub struct MatchCommand {
    #[command(flatten)]
    pub extract: ExtractOptions,
    #[command(flatten)]
    pub search: SearchOptions,
    /// 图片1
    pub image1: String,
    /// 图片2
    pub image2: String,
    /// 将匹配结果画出并保存到文件
    pub output: Option<String>,
}

impl SubCommandExtend for MatchCommand {
    async fn run(&self, _opts: &Opts) -> Result<()> {
        block_in_place(|| {
            let mut extractor = SiftExtractor::create(self.extract.clone())?;
            let img1 = extractor.preprocess(utils::imread(&self.image1)?)?;
            let img2 = extractor.preprocess(utils::imread(&self.image2)?)?;

            let (Some(f1), Some(f2)) = (extractor.detect(&img1)?, extractor.detect(&img2)?) else {
                println!("0");
                return Ok(());
            };

            let mut verifier = SpatialVerifier::create(&self.search)?;
            let matches = verifier.ratio_matches(&f1, &f2)?;
            let score = verifier.score(&f1, &f2)?;
            println!("{score}");

            if let Some(file) = &self.output {
                let output = utils::draw_matches(&img1, f1.keypoints(), &img2, f2.keypoints(), &matches)?;
                utils::imwrite(file, &output)?;
            }
            Ok(())
        })
    }
}
