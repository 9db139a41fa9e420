//! 空间验证：比率测试筛选匹配点，再用单应性估计的内点数作为分数

use anyhow::Result;
use ndarray::ArrayView2;
use opencv::core::{self, DMatch, Mat, Point2f, Ptr, Vector};
use opencv::prelude::*;
use opencv::{calib3d, features2d, flann};

use crate::config::SearchOptions;
use crate::feature::FeatureSet;

/// 单应性至少需要 4 组对应点
pub const MIN_MATCHES: usize = 4;

/// 根据对应点估计单应性，返回内点数量
pub trait HomographyEstimator {
    fn inliers(&mut self, src: &[Point2f], dst: &[Point2f]) -> Result<usize>;
}

/// USAC MAGSAC 鲁棒估计
pub struct RansacHomography {
    threshold: f64,
}

impl RansacHomography {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl HomographyEstimator for RansacHomography {
    fn inliers(&mut self, src: &[Point2f], dst: &[Point2f]) -> Result<usize> {
        let src = Vector::<Point2f>::from_slice(src);
        let dst = Vector::<Point2f>::from_slice(dst);
        let mut mask = Mat::default();
        let h = calib3d::find_homography(&src, &dst, &mut mask, calib3d::USAC_MAGSAC, self.threshold)?;
        if h.empty() || mask.empty() {
            return Ok(0);
        }
        Ok(core::count_non_zero(&mask)? as usize)
    }
}

/// 对已经通过比率测试的匹配计算分数，匹配数量不足时直接返回 0，不调用估计器
pub fn score_matches<E: HomographyEstimator>(
    estimator: &mut E,
    query: &FeatureSet,
    candidate: &FeatureSet,
    matches: &[(usize, usize)],
) -> Result<usize> {
    if matches.len() < MIN_MATCHES {
        return Ok(0);
    }
    let (src, dst): (Vec<_>, Vec<_>) = matches
        .iter()
        .map(|&(q, t)| {
            let (a, b) = (query.keypoints()[q], candidate.keypoints()[t]);
            (Point2f::new(a.x, a.y), Point2f::new(b.x, b.y))
        })
        .unzip();
    estimator.inliers(&src, &dst)
}

fn default_flann_matcher() -> Result<features2d::FlannBasedMatcher> {
    let index_params = Ptr::new(flann::IndexParams::from(flann::KDTreeIndexParams::new(5)?));
    let search_params = Ptr::new(flann::SearchParams::new_1(50, 0.0, true)?);
    Ok(features2d::FlannBasedMatcher::new(&index_params, &search_params)?)
}

fn to_mat(descriptors: ArrayView2<f32>) -> Result<Mat> {
    let descriptors = descriptors.as_standard_layout();
    let data = descriptors.as_slice().unwrap_or_default();
    let mat = Mat::new_rows_cols_with_data(descriptors.nrows() as i32, descriptors.ncols() as i32, data)?;
    Ok(mat.try_clone()?)
}

pub struct SpatialVerifier<E = RansacHomography> {
    matcher: features2d::FlannBasedMatcher,
    estimator: E,
    ratio: f32,
}

impl SpatialVerifier {
    pub fn create(opts: &SearchOptions) -> Result<Self> {
        Self::with_estimator(opts, RansacHomography::new(opts.ransac_threshold))
    }
}

impl<E: HomographyEstimator> SpatialVerifier<E> {
    pub fn with_estimator(opts: &SearchOptions, estimator: E) -> Result<Self> {
        Ok(Self { matcher: default_flann_matcher()?, estimator, ratio: opts.ratio })
    }

    /// 最近邻与次近邻匹配，只保留明显优于次近邻的匹配，返回 (查询下标, 候选下标)
    pub fn ratio_matches(&mut self, query: &FeatureSet, candidate: &FeatureSet) -> Result<Vec<(usize, usize)>> {
        // knn 匹配需要候选至少有 2 个描述符
        if query.is_empty() || candidate.len() < 2 {
            return Ok(vec![]);
        }
        let des1 = to_mat(query.descriptors())?;
        let des2 = to_mat(candidate.descriptors())?;

        let mut matches = Vector::<Vector<DMatch>>::new();
        let mask = Mat::default();
        self.matcher.knn_train_match(&des1, &des2, &mut matches, 2, &mask, false)?;

        let mut good = vec![];
        for m in matches.iter() {
            if m.len() != 2 {
                continue;
            }
            let (m, n) = (m.get(0)?, m.get(1)?);
            if m.distance < self.ratio * n.distance {
                good.push((m.query_idx as usize, m.train_idx as usize));
            }
        }
        Ok(good)
    }

    /// 计算两组特征之间的空间验证分数（内点数）
    pub fn score(&mut self, query: &FeatureSet, candidate: &FeatureSet) -> Result<usize> {
        let matches = self.ratio_matches(query, candidate)?;
        score_matches(&mut self.estimator, query, candidate, &matches)
    }
}
