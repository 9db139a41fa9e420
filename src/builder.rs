//! 索引构建：补全特征文件、训练词典、计算 VLAD 向量

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressIterator};
use log::{info, warn};
use ndarray::prelude::*;
use rayon::prelude::*;
use serde::Serialize;

use crate::config::{ExtractOptions, TrainOptions};
use crate::corpus::{self, ReferenceEntry};
use crate::feature::SiftExtractor;
use crate::sidecar::{self, SidecarStatus};
use crate::state::EngineState;
use crate::utils::pb_style;
use crate::vlad;
use crate::vocab::{self, Vocabulary};

/// 单张参考图片的特征文件检查结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealOutcome {
    /// 特征文件可用
    Fresh,
    /// 特征文件缺失或过期，已重新提取
    Extracted,
    /// 图片无法读取或没有特征点
    Failed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BuildStats {
    /// 找到的参考图片数量
    pub images: usize,
    /// 本次重新提取特征的图片数量
    pub extracted: usize,
    /// 被跳过的图片数量
    pub failed: usize,
    /// 写入索引的图片数量
    pub references: usize,
}

/// 检查图片的特征文件，缺失或过期时重新提取
pub fn heal_sidecar(extractor: &mut SiftExtractor, image: &Path) -> HealOutcome {
    let data = match fs::read(image) {
        Ok(data) => data,
        Err(e) => {
            warn!("无法读取图片 {}: {e}", image.display());
            return HealOutcome::Failed;
        }
    };
    let hash = blake3::hash(&data);
    let path = sidecar::sidecar_path(image);
    if sidecar::status(&hash, &path) == SidecarStatus::Fresh {
        return HealOutcome::Fresh;
    }

    match extractor.extract_bytes(&data) {
        Ok(Some(features)) => match sidecar::save(&path, &features, &hash) {
            Ok(()) => HealOutcome::Extracted,
            Err(e) => {
                warn!("无法保存特征文件 {}: {e}", path.display());
                HealOutcome::Failed
            }
        },
        Ok(None) => {
            warn!("图片没有特征点，跳过: {}", image.display());
            HealOutcome::Failed
        }
        Err(e) => {
            warn!("无法提取特征，跳过 {}: {e}", image.display());
            HealOutcome::Failed
        }
    }
}

/// 扫描参考图片目录并构建新的引擎状态
///
/// 根目录不可访问时返回错误；没有任何可用描述符时不产生状态，此时不能替换现有的索引。
/// `prior` 仅在 `reuse_vocabulary` 时使用
pub fn build(
    root: &Path,
    extract: &ExtractOptions,
    train: &TrainOptions,
    prior: Option<&Vocabulary>,
) -> Result<(BuildStats, Option<EngineState>)> {
    let images = corpus::scan_references(root)?;
    let mut stats = BuildStats { images: images.len(), ..Default::default() };
    info!("找到 {} 张参考图片", images.len());

    // 1. 补全特征文件
    let pb = ProgressBar::new(images.len() as u64).with_style(pb_style());
    pb.set_message("检查特征文件");
    let outcomes = images
        .par_iter()
        .progress_with(pb.clone())
        .map_init(
            || SiftExtractor::create(extract.clone()),
            |extractor, image| match extractor {
                Ok(extractor) => heal_sidecar(extractor, image),
                Err(e) => {
                    warn!("无法创建特征提取器: {e}");
                    HealOutcome::Failed
                }
            },
        )
        .collect::<Vec<_>>();
    pb.finish_and_clear();

    let mut usable: Vec<(ReferenceEntry, PathBuf)> = vec![];
    for (image, outcome) in images.iter().zip(outcomes) {
        match outcome {
            HealOutcome::Failed => stats.failed += 1,
            HealOutcome::Extracted => stats.extracted += 1,
            HealOutcome::Fresh => {}
        }
        if outcome == HealOutcome::Failed {
            continue;
        }
        match corpus::parse_reference_entry(root, image) {
            Some(entry) => usable.push((entry, sidecar::sidecar_path(image))),
            None => {
                warn!("无法解析参考图片路径: {}", image.display());
                stats.failed += 1;
            }
        }
    }
    info!("重新提取 {} 张，跳过 {} 张", stats.extracted, stats.failed);

    // 2. 训练词典
    let cap = extract.max_keypoints;
    let vocab = match prior.filter(|_| train.reuse_vocabulary) {
        Some(vocab) => {
            info!("复用现有词典");
            vocab.clone()
        }
        None => {
            info!("训练词典中，聚类中心数量：{}", train.clusters);
            let pb = ProgressBar::new(usable.len() as u64).with_style(pb_style());
            pb.set_message("训练词典");
            let descriptors = usable
                .iter()
                .progress_with(pb.clone())
                .filter_map(|(_, path)| sidecar::load(path, cap))
                .map(|features| features.into_descriptors());
            let trained = vocab::train(descriptors, train);
            pb.finish_and_clear();
            match trained {
                Some(vocab) => vocab,
                None => {
                    warn!("没有可用于训练的描述符，不生成词典");
                    return Ok((stats, None));
                }
            }
        }
    };

    // 3. 计算 VLAD 向量，保持与元数据的顺序一致
    let pb = ProgressBar::new(usable.len() as u64).with_style(pb_style());
    pb.set_message("计算 VLAD 向量");
    let encoded = usable
        .par_iter()
        .progress_with(pb.clone())
        .map(|(entry, path)| match sidecar::load(path, cap) {
            Some(features) => Some((entry.clone(), vlad::encode(&features, &vocab))),
            None => {
                warn!("特征文件不可读，跳过: {}", path.display());
                None
            }
        })
        .collect::<Vec<_>>();
    pb.finish_and_clear();

    let encoded = encoded.into_iter().flatten().collect::<Vec<_>>();
    stats.failed += usable.len() - encoded.len();
    if encoded.is_empty() {
        warn!("没有可用的参考图片");
        return Ok((stats, None));
    }

    let mut vectors = Array2::<f32>::zeros((encoded.len(), vlad::vlad_dim(&vocab)));
    let mut entries = Vec::with_capacity(encoded.len());
    for (mut row, (entry, v)) in vectors.rows_mut().into_iter().zip(encoded) {
        row.assign(&v);
        entries.push(entry);
    }
    stats.references = entries.len();

    let state = EngineState::new(vocab, entries, vectors)?;
    info!("索引构建完成，共 {} 张参考图片", stats.references);
    Ok((stats, Some(state)))
}
