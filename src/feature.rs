use std::path::Path;

use anyhow::{Result, ensure};
use ndarray::{Array2, ArrayView2, Axis};
use opencv::core::{Mat, Ptr, Size, Vector};
use opencv::features2d::SIFT;
use opencv::imgproc::{self, CLAHE};
use opencv::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample;

use crate::config::{DESCRIPTOR_DIM, ExtractOptions};
use crate::utils;

/// 特征点抽样使用的固定种子，保证同一份数据多次抽样结果一致
const SUBSAMPLE_SEED: u64 = 0x5eed;

/// 单个特征点，对应 OpenCV 的 KeyPoint
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub size: f32,
    pub angle: f32,
    pub response: f32,
    pub octave: i32,
    pub class_id: i32,
}

impl From<&opencv::core::KeyPoint> for Keypoint {
    fn from(kp: &opencv::core::KeyPoint) -> Self {
        let pt = kp.pt();
        Self {
            x: pt.x,
            y: pt.y,
            size: kp.size(),
            angle: kp.angle(),
            response: kp.response(),
            octave: kp.octave(),
            class_id: kp.class_id(),
        }
    }
}

/// 一张图片的局部特征：特征点和 N x 128 的描述符矩阵，第 i 行对应第 i 个特征点
#[derive(Debug, Clone)]
pub struct FeatureSet {
    keypoints: Vec<Keypoint>,
    descriptors: Array2<f32>,
}

impl FeatureSet {
    pub fn new(keypoints: Vec<Keypoint>, descriptors: Array2<f32>) -> Result<Self> {
        ensure!(
            keypoints.len() == descriptors.nrows(),
            "特征点数量 {} 与描述符行数 {} 不一致",
            keypoints.len(),
            descriptors.nrows()
        );
        ensure!(descriptors.ncols() == DESCRIPTOR_DIM, "描述符维数必须为 {DESCRIPTOR_DIM}");
        Ok(Self { keypoints, descriptors })
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    pub fn keypoints(&self) -> &[Keypoint] {
        &self.keypoints
    }

    pub fn descriptors(&self) -> ArrayView2<'_, f32> {
        self.descriptors.view()
    }

    pub fn into_descriptors(self) -> Array2<f32> {
        self.descriptors
    }

    /// 数量超过 cap 时随机抽取 cap 个特征，特征点和描述符同步抽取，并保持原有顺序
    pub fn truncate(self, cap: usize) -> Self {
        if self.len() <= cap {
            return self;
        }
        let mut rng = StdRng::seed_from_u64(SUBSAMPLE_SEED);
        let mut indices = sample(&mut rng, self.len(), cap).into_vec();
        indices.sort_unstable();
        let keypoints = indices.iter().map(|&i| self.keypoints[i]).collect();
        let descriptors = self.descriptors.select(Axis(0), &indices);
        Self { keypoints, descriptors }
    }
}

/// CLAHE 增强 + SIFT 特征提取
pub struct SiftExtractor {
    sift: Ptr<SIFT>,
    clahe: Ptr<CLAHE>,
    opts: ExtractOptions,
}

impl SiftExtractor {
    pub fn create(opts: ExtractOptions) -> Result<Self> {
        let sift = SIFT::create(
            opts.sift_nfeatures,
            opts.sift_octave_layers,
            opts.sift_contrast_threshold,
            opts.sift_edge_threshold,
            opts.sift_sigma,
            false,
        )?;
        let (rows, cols) = opts.clahe_tile_grid;
        let clahe = imgproc::create_clahe(opts.clahe_clip_limit, Size::new(cols, rows))?;
        Ok(Self { sift, clahe, opts })
    }

    /// 缩放并增强局部对比度，返回实际用于提取特征的图片
    pub fn preprocess(&mut self, image: Mat) -> Result<Mat> {
        let image = utils::adjust_image_size(image, self.opts.max_dimension)?;
        let mut output = Mat::default();
        self.clahe.apply(&image, &mut output)?;
        Ok(output)
    }

    /// 提取灰度图片的特征，没有检测到任何特征点时返回 None
    pub fn extract(&mut self, image: Mat) -> Result<Option<FeatureSet>> {
        let image = self.preprocess(image)?;
        self.detect(&image)
    }

    pub fn extract_file(&mut self, path: impl AsRef<Path>) -> Result<Option<FeatureSet>> {
        let image = utils::imread(path)?;
        self.extract(image)
    }

    pub fn extract_bytes(&mut self, bytes: &[u8]) -> Result<Option<FeatureSet>> {
        let image = utils::imdecode(bytes)?;
        self.extract(image)
    }

    /// 在已经预处理过的图片上检测特征
    pub fn detect(&mut self, image: &Mat) -> Result<Option<FeatureSet>> {
        let mask = Mat::default();
        let mut kps = Vector::new();
        let mut des = Mat::default();
        self.sift.detect_and_compute(image, &mask, &mut kps, &mut des, false)?;

        if kps.is_empty() || des.empty() {
            return Ok(None);
        }

        let keypoints = kps.iter().map(|kp| Keypoint::from(&kp)).collect::<Vec<_>>();
        let descriptors = mat_to_array(&des)?;
        let features = FeatureSet::new(keypoints, descriptors)?;
        Ok(Some(features.truncate(self.opts.max_keypoints)))
    }
}

/// 将 CV_32F 描述符矩阵转换为 ndarray
pub fn mat_to_array(des: &Mat) -> Result<Array2<f32>> {
    let (rows, cols) = (des.rows() as usize, des.cols() as usize);
    let data = if des.is_continuous() {
        des.data_typed::<f32>()?.to_vec()
    } else {
        // clone 出来的矩阵总是连续的
        des.try_clone()?.data_typed::<f32>()?.to_vec()
    };
    Ok(Array2::from_shape_vec((rows, cols), data)?)
}
