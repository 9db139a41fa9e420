use std::convert::Infallible;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use log::{error, warn};
use serde::Serialize;
use tokio::task::{block_in_place, spawn_blocking};

use crate::cli::SubCommandExtend;
use crate::config::{ExtractOptions, SearchOptions, TrainOptions};
use crate::{Candidate, EngineBuilder, Opts, metrics};

#[derive(Parser, Debug, Clone)]
pub struct SearchCommand {
    #[command(flatten)]
    pub extract: ExtractOptions,
    #[command(flatten)]
    pub search: SearchOptions,
    #[command(flatten)]
    pub train: TrainOptions,
    /// 被搜索的图片路径
    #[arg(required = true)]
    pub images: Vec<PathBuf>,
    /// 只搜索该地点（州或地点目录名）的海龟，没有结果时自动搜索全部地点
    #[arg(short, long, value_name = "NAME")]
    pub location: Option<String>,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", default_value = "table")]
    pub output_format: OutputFormat,
    /// 索引不可用时不自动重建
    #[arg(long)]
    pub no_rebuild: bool,
    /// prometheus 推送地址
    #[arg(long, value_name = "URL")]
    pub prometheus_push: Option<String>,
    /// 自定义 instance 标签值
    #[arg(long, value_name = "NAME", default_value = "plastron")]
    pub prometheus_instance: String,
    /// prometheus 认证信息，格式为 username:password
    #[arg(long, value_name = "AUTH")]
    pub prometheus_auth: Option<String>,
}

#[derive(Serialize)]
struct SearchOutput<'a> {
    image: &'a PathBuf,
    result: Vec<Candidate>,
}

impl SubCommandExtend for SearchCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let engine = EngineBuilder::new(opts.conf_dir.clone())
            .extract(self.extract.clone())
            .train(self.train.clone())
            .search(self.search.clone())
            .open();

        if !self.no_rebuild {
            let root = opts.root();
            // 重建失败时仍然使用现有状态搜索，结果可能为空
            if let Err(e) = block_in_place(|| engine.ensure_ready(&root)) {
                warn!("无法重建索引: {e}");
            }
        }

        let outputs = self
            .images
            .iter()
            .map(|image| {
                let result = block_in_place(|| engine.search_file(image, self.location.as_deref()));
                SearchOutput { image, result }
            })
            .collect::<Vec<_>>();
        print_result(&outputs, self)?;

        if let Some(url) = self.prometheus_push.clone() {
            let instance = self.prometheus_instance.clone();
            let auth = self.prometheus_auth.clone();
            let r = spawn_blocking(move || metrics::push(&url, &instance, auth.as_deref())).await?;
            if let Err(e) = r {
                error!("推送指标失败: {e}");
            }
        }
        Ok(())
    }
}

fn print_result(outputs: &[SearchOutput], opts: &SearchCommand) -> Result<()> {
    match opts.output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(outputs)?)
        }
        OutputFormat::Table => {
            for output in outputs {
                if outputs.len() > 1 {
                    println!("# {}", output.image.display());
                }
                if output.result.is_empty() {
                    println!("no match");
                }
                for c in &output.result {
                    let mirrored = if c.mirrored { "\tmirrored" } else { "" };
                    println!(
                        "{}\t{}\t{}/{}\t{}{}",
                        c.spatial_score,
                        c.turtle_id,
                        c.state,
                        c.location,
                        c.source_path.display(),
                        mirrored
                    );
                }
            }
        }
    }
    Ok(())
}

#[derive(ValueEnum, Debug, Clone)]
pub enum OutputFormat {
    Json,
    Table,
}

impl FromStr for OutputFormat {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            _ => Ok(Self::Table),
        }
    }
}
