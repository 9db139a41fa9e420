use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use clap::{Parser, Subcommand};
use directories::ProjectDirs;

use crate::cli::*;

static CONF_DIR: LazyLock<ConfDir> = LazyLock::new(|| {
    let proj_dirs = ProjectDirs::from("", "plastron", "plastron").expect("failed to get project dir");
    ConfDir { path: proj_dirs.config_dir().to_path_buf() }
});

fn default_config_dir() -> &'static str {
    CONF_DIR.path().to_str().unwrap()
}

/// SIFT 描述符维数
pub const DESCRIPTOR_DIM: usize = 128;

#[derive(Parser, Debug, Clone)]
pub struct ExtractOptions {
    /// 图片最长边的最大像素数，超过则使用 INTER_AREA 等比缩小
    #[arg(long, value_name = "PIXELS", default_value_t = 1200)]
    pub max_dimension: i32,
    /// CLAHE 对比度限制
    #[arg(long, value_name = "LIMIT", default_value_t = 1.0)]
    pub clahe_clip_limit: f64,
    /// CLAHE 网格大小
    #[arg(long, value_name = "ROWSxCOLS", value_parser = parse_size, default_value = "16x16")]
    pub clahe_tile_grid: (i32, i32),
    /// SIFT 特征点最大保留数量
    #[arg(long, value_name = "N", default_value_t = 10000)]
    pub sift_nfeatures: i32,
    /// SIFT 每个 octave 的层数
    #[arg(long, value_name = "N", default_value_t = 3)]
    pub sift_octave_layers: i32,
    /// SIFT 对比度阈值，越小则低对比度区域的特征点越多
    #[arg(long, value_name = "THRESHOLD", default_value_t = 0.03)]
    pub sift_contrast_threshold: f64,
    /// SIFT 边缘阈值
    #[arg(long, value_name = "THRESHOLD", default_value_t = 10.)]
    pub sift_edge_threshold: f64,
    /// SIFT 高斯模糊 sigma
    #[arg(long, value_name = "SIGMA", default_value_t = 1.6)]
    pub sift_sigma: f64,
    /// 单张图片最多保留的特征点数量，超过则随机抽样
    #[arg(long, value_name = "N", default_value_t = 15000)]
    pub max_keypoints: usize,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            max_dimension: 1200,
            clahe_clip_limit: 1.0,
            clahe_tile_grid: (16, 16),
            sift_nfeatures: 10000,
            sift_octave_layers: 3,
            sift_contrast_threshold: 0.03,
            sift_edge_threshold: 10.,
            sift_sigma: 1.6,
            max_keypoints: 15000,
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct TrainOptions {
    /// 视觉词典的聚类中心数量
    #[arg(long, value_name = "K", default_value_t = 64)]
    pub clusters: usize,
    /// 训练时每张图片最多抽取的描述符数量
    #[arg(long, value_name = "N", default_value_t = 10000)]
    pub samples_per_image: usize,
    /// 多少张图片的描述符累积为一个 mini-batch
    #[arg(long, value_name = "N", default_value_t = 100)]
    pub batch_images: usize,
    /// 抽样和初始化使用的随机种子
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
    /// 重建时复用当前已加载的词典，而不是重新训练
    #[arg(long)]
    pub reuse_vocabulary: bool,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self { clusters: 64, samples_per_image: 10000, batch_images: 100, seed: 42, reuse_vocabulary: false }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct SearchOptions {
    /// 最终返回的结果数量
    #[arg(long, value_name = "COUNT", default_value_t = 5)]
    pub count: usize,
    /// 进入空间验证的候选数量
    #[arg(long, value_name = "K", default_value_t = 20)]
    pub verify_top: usize,
    /// 比率测试阈值，最近邻距离必须小于次近邻距离乘以该值
    #[arg(long, value_name = "RATIO", default_value_t = 0.75)]
    pub ratio: f32,
    /// 单应性估计的重投影误差阈值（像素）
    #[arg(long, value_name = "PIXELS", default_value_t = 5.0)]
    pub ransac_threshold: f64,
    /// 最佳内点数低于该值时，尝试镜像搜索
    #[arg(long, value_name = "INLIERS", default_value_t = 15)]
    pub mirror_threshold: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self { count: 5, verify_top: 20, ratio: 0.75, ransac_threshold: 5.0, mirror_threshold: 15 }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "plastron", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// plastron 配置文件目录，索引文件保存在这里
    #[arg(short, long, default_value = default_config_dir())]
    pub conf_dir: ConfDir,
    /// 参考图片根目录，默认为配置目录下的 data
    #[arg(short, long, value_name = "DIR")]
    pub root: Option<PathBuf>,
}

impl Opts {
    pub fn root(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(|| self.conf_dir.data())
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 扫描参考图片目录，重建词典和索引
    Rebuild(RebuildCommand),
    /// 在索引中搜索一张或多张图片
    Search(SearchCommand),
    /// 添加一只新海龟的参考图片，并重建索引
    Add(AddCommand),
    /// 从 <州>/<地点>/<图片> 结构的目录批量导入参考图片
    Ingest(IngestCommand),
    /// 为已存在的海龟添加一张观察图片
    Observe(ObserveCommand),
    /// 计算两张图片之间的空间验证分数
    Match(MatchCommand),
    /// 显示图片提取出的特征点
    Show(ShowCommand),
    /// 删除所有索引文件
    Clean(CleanCommand),
    /// 列出所有 州/地点
    Locations(LocationsCommand),
}

#[derive(Debug, Clone)]
pub struct ConfDir {
    path: PathBuf,
}

impl ConfDir {
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 默认的参考图片根目录
    pub fn data(&self) -> PathBuf {
        self.path.join("data")
    }

    /// 当前生效的索引文件集合
    pub fn artifacts(&self) -> ArtifactPaths {
        ArtifactPaths(self.path.join("artifacts"))
    }

    /// 重建时写入的临时索引文件集合
    pub fn staging(&self) -> ArtifactPaths {
        ArtifactPaths(self.path.join("artifacts.tmp"))
    }

    /// 替换过程中被换下的旧索引文件集合
    pub fn retired(&self) -> ArtifactPaths {
        ArtifactPaths(self.path.join("artifacts.old"))
    }
}

impl FromStr for ConfDir {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self { path: PathBuf::from(s) })
    }
}

impl From<&Path> for ConfDir {
    fn from(path: &Path) -> Self {
        Self { path: path.to_path_buf() }
    }
}

/// 一组必须同时存在、同时替换的索引文件
#[derive(Debug, Clone)]
pub struct ArtifactPaths(PathBuf);

impl ArtifactPaths {
    pub fn dir(&self) -> &Path {
        &self.0
    }

    /// 视觉词典
    pub fn vocabulary(&self) -> PathBuf {
        self.0.join("vocabulary.bin")
    }

    /// 最近邻索引
    pub fn index(&self) -> PathBuf {
        self.0.join("index.usearch")
    }

    /// 参考图片元数据，与向量矩阵逐行对应
    pub fn metadata(&self) -> PathBuf {
        self.0.join("metadata.bin")
    }

    /// VLAD 向量矩阵
    pub fn vectors(&self) -> PathBuf {
        self.0.join("vectors.npy")
    }

    /// 清单文件，最后写入，用于校验整个集合
    pub fn manifest(&self) -> PathBuf {
        self.0.join("manifest.json")
    }
}

fn parse_size(s: &str) -> anyhow::Result<(i32, i32)> {
    let parts: Vec<&str> = s.split('x').collect();
    if parts.len() != 2 {
        return Err(anyhow::anyhow!("无效的尺寸: {}", s));
    }
    Ok((parts[0].parse()?, parts[1].parse()?))
}
