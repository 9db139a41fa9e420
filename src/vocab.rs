use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{Result, ensure};
use linfa::traits::FitWith;
use linfa::{DatasetBase, ParamGuard};
use linfa_clustering::{IncrKMeansError, KMeans, KMeansValidParams};
use linfa_nn::distance::L2Dist;
use log::{debug, info, warn};
use ndarray::prelude::*;
use ndarray::concatenate;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand_xoshiro::Xoshiro256Plus;
use rand_xoshiro::rand_core::SeedableRng as _;
use serde::{Deserialize, Serialize};

use crate::config::{DESCRIPTOR_DIM, TrainOptions};

/// 视觉词典：K 个 128 维的聚类中心
///
/// 只能通过训练完成的聚类中心构造，不存在“未训练”的词典
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vocabulary {
    centers: Array2<f32>,
}

impl Vocabulary {
    pub fn from_centers(centers: Array2<f32>) -> Result<Self> {
        ensure!(centers.nrows() > 0, "词典没有聚类中心");
        ensure!(centers.ncols() == DESCRIPTOR_DIM, "聚类中心维数必须为 {DESCRIPTOR_DIM}");
        ensure!(centers.iter().all(|x| x.is_finite()), "聚类中心包含非法数值");
        Ok(Self { centers })
    }

    /// 聚类中心数量
    pub fn k(&self) -> usize {
        self.centers.nrows()
    }

    pub fn dim(&self) -> usize {
        self.centers.ncols()
    }

    pub fn centers(&self) -> ArrayView2<'_, f32> {
        self.centers.view()
    }

    /// 为每个描述符找到最近的聚类中心
    pub fn assign(&self, descriptors: ArrayView2<f32>) -> Vec<usize> {
        assign(descriptors, self.centers.view())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let vocab: Vocabulary = bincode::deserialize_from(reader)?;
        // 反序列化后重新校验，保证读出来的一定是可用的词典
        Self::from_centers(vocab.centers)
    }
}

/// 计算每一行最近的中心编号
///
/// 利用 |x - c|^2 = |x|^2 - 2 x·c + |c|^2，|x|^2 对所有中心相同可以省去，一次矩阵乘法算完
fn assign(x: ArrayView2<f32>, centers: ArrayView2<f32>) -> Vec<usize> {
    if x.nrows() == 0 {
        return vec![];
    }
    let c_norms = centers.rows().into_iter().map(|c| c.dot(&c)).collect::<Vec<_>>();
    let products = x.dot(&centers.t());
    products
        .rows()
        .into_iter()
        .map(|xp| {
            let mut best = (0, f32::INFINITY);
            for (j, (&p, &cn)) in xp.iter().zip(&c_norms).enumerate() {
                let d = cn - 2. * p;
                if d < best.1 {
                    best = (j, d);
                }
            }
            best.0
        })
        .collect()
}

/// 计算聚类不平衡度，1 表示完全平衡
pub fn imbalance_factor(hist: &[u64]) -> f32 {
    let (mut tot, mut uf) = (0.0, 0.0);
    for &h in hist {
        let h = h as f32;
        tot += h;
        uf += h.powf(2.0);
    }
    if tot == 0. {
        return 0.;
    }
    uf * hist.len() as f32 / tot.powf(2.0)
}

/// 增量 (mini-batch) k-means，每个批次调用一次 `fit_with`
pub struct IncrementalTrainer {
    params: KMeansValidParams<f32, Xoshiro256Plus, L2Dist>,
    model: Option<KMeans<f32, L2Dist>>,
    /// 第一次初始化之前样本数量可能不足 k，先缓存起来
    pending: Option<Array2<f32>>,
    hist: Vec<u64>,
    steps: usize,
}

impl IncrementalTrainer {
    pub fn new(k: usize, seed: u64) -> Result<Self> {
        let params = KMeans::params_with_rng(k, Xoshiro256Plus::seed_from_u64(seed)).tolerance(1e-3).check()?;
        Ok(Self { params, model: None, pending: None, hist: vec![0; k], steps: 0 })
    }

    /// 已执行的更新步数
    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn partial_fit(&mut self, batch: Array2<f32>) {
        let k = self.hist.len();
        if batch.nrows() == 0 {
            return;
        }
        let batch = match self.pending.take() {
            Some(pending) => match concatenate(Axis(0), &[pending.view(), batch.view()]) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!("无法合并训练样本: {e}");
                    return;
                }
            },
            None => batch,
        };
        if self.model.is_none() && batch.nrows() < k {
            debug!("样本数量 {} 少于聚类中心数量 {k}，等待更多数据", batch.nrows());
            self.pending = Some(batch);
            return;
        }

        let dataset = DatasetBase::from(batch);
        let model = match self.params.fit_with(self.model.take(), &dataset) {
            Ok(model) => model,
            // 单个批次不需要收敛，模型照常更新
            Err(IncrKMeansError::NotConverged(model)) => model,
            Err(e) => {
                warn!("词典训练失败: {e}");
                return;
            }
        };
        for label in assign(dataset.records().view(), model.centroids().view()) {
            self.hist[label] += 1;
        }
        self.model = Some(model);
        self.steps += 1;
    }

    /// 训练结束，至少完成过一次更新时返回词典
    pub fn finish(self) -> Option<Vocabulary> {
        let model = self.model?;
        info!("词典训练完成，共 {} 步，不平衡度：{:.2}", self.steps, imbalance_factor(&self.hist));
        Vocabulary::from_centers(model.centroids().to_owned()).ok()
    }
}

/// 使用所有参考图片的描述符训练词典
///
/// 每张图片最多抽取 `samples_per_image` 个描述符，每 `batch_images` 张图片执行一次更新。
/// 没有任何可用描述符时返回 None，调用方不能保存或使用词典
pub fn train<I>(descriptor_sets: I, opts: &TrainOptions) -> Option<Vocabulary>
where
    I: IntoIterator<Item = Array2<f32>>,
{
    let mut trainer = match IncrementalTrainer::new(opts.clusters, opts.seed) {
        Ok(trainer) => trainer,
        Err(e) => {
            warn!("无效的词典参数: {e}");
            return None;
        }
    };
    let mut rng = StdRng::seed_from_u64(opts.seed);
    let mut batch = vec![];
    let mut images = 0;

    let flush = |trainer: &mut IncrementalTrainer, batch: &mut Vec<Array2<f32>>| {
        if batch.is_empty() {
            return;
        }
        let views = batch.iter().map(|a| a.view()).collect::<Vec<_>>();
        if let Ok(data) = concatenate(Axis(0), &views) {
            info!("词典训练：第 {} 批，{} 个描述符", trainer.steps() + 1, data.nrows());
            trainer.partial_fit(data);
        }
        batch.clear();
    };

    for des in descriptor_sets {
        if des.nrows() == 0 {
            continue;
        }
        let des = if des.nrows() > opts.samples_per_image {
            let idx = sample(&mut rng, des.nrows(), opts.samples_per_image).into_vec();
            des.select(Axis(0), &idx)
        } else {
            des
        };
        batch.push(des);
        images += 1;
        if batch.len() >= opts.batch_images {
            flush(&mut trainer, &mut batch);
        }
    }
    flush(&mut trainer, &mut batch);

    debug!("参与词典训练的图片数量：{images}");
    trainer.finish()
}
