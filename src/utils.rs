use std::path::Path;

use anyhow::{Result, anyhow};
use indicatif::ProgressStyle;
use opencv::core::{self, DMatch, KeyPoint, Mat, Scalar, Size, Vector};
use opencv::prelude::*;
use opencv::{features2d, imgcodecs, imgproc};

use crate::feature::Keypoint;

/// 以灰度模式读取图片
pub fn imread(path: impl AsRef<Path>) -> Result<Mat> {
    let path = path.as_ref();
    let filename = path.to_str().ok_or_else(|| anyhow!("非 UTF-8 路径: {}", path.display()))?;
    let img = imgcodecs::imread(filename, imgcodecs::IMREAD_GRAYSCALE)?;
    // OpenCV 读取失败时不会报错，而是返回空矩阵
    if img.empty() {
        return Err(anyhow!("无法解码图片: {}", path.display()));
    }
    Ok(img)
}

/// 以灰度模式解码内存中的图片
pub fn imdecode(bytes: &[u8]) -> Result<Mat> {
    let mat = Mat::from_slice(bytes)?;
    let img = imgcodecs::imdecode(&mat, imgcodecs::IMREAD_GRAYSCALE)?;
    if img.empty() {
        return Err(anyhow!("无法解码图片数据"));
    }
    Ok(img)
}

pub fn imwrite(path: impl AsRef<Path>, img: &impl core::ToInputArray) -> Result<()> {
    let path = path.as_ref();
    let filename = path.to_str().ok_or_else(|| anyhow!("非 UTF-8 路径: {}", path.display()))?;
    if !imgcodecs::imwrite(filename, img, &Vector::new())? {
        return Err(anyhow!("无法写入图片: {}", path.display()));
    }
    Ok(())
}

/// 如果图片最长边超过 max_dimension，则等比缩小
pub fn adjust_image_size(img: Mat, max_dimension: i32) -> opencv::Result<Mat> {
    let longest = img.cols().max(img.rows());
    if longest <= max_dimension {
        return Ok(img);
    }
    let scale = max_dimension as f64 / longest as f64;
    let width = ((img.cols() as f64 * scale) as i32).max(1);
    let height = ((img.rows() as f64 * scale) as i32).max(1);
    let mut output = Mat::default();
    imgproc::resize(
        &img,
        &mut output,
        Size::new(width, height),
        0.,
        0.,
        imgproc::InterpolationFlags::INTER_AREA as i32,
    )?;
    Ok(output)
}

/// 水平翻转图片
pub fn mirror(img: &Mat) -> opencv::Result<Mat> {
    let mut output = Mat::default();
    core::flip(img, &mut output, 1)?;
    Ok(output)
}

pub fn to_cv_keypoints(keypoints: &[Keypoint]) -> opencv::Result<Vector<KeyPoint>> {
    keypoints
        .iter()
        .map(|kp| {
            KeyPoint::new_coords(kp.x, kp.y, kp.size, kp.angle, kp.response, kp.octave, kp.class_id)
        })
        .collect()
}

pub fn draw_keypoints(image: &Mat, keypoints: &[Keypoint]) -> opencv::Result<Mat> {
    let mut output = Mat::default();
    features2d::draw_keypoints(
        image,
        &to_cv_keypoints(keypoints)?,
        &mut output,
        Scalar::all(-1.0),
        features2d::DrawMatchesFlags::DRAW_RICH_KEYPOINTS,
    )?;
    Ok(output)
}

pub fn draw_matches(
    img1: &Mat,
    keypoints1: &[Keypoint],
    img2: &Mat,
    keypoints2: &[Keypoint],
    matches: &[(usize, usize)],
) -> opencv::Result<Mat> {
    let matches = matches
        .iter()
        .map(|&(q, t)| DMatch { query_idx: q as i32, train_idx: t as i32, img_idx: -1, distance: 0. })
        .collect::<Vector<DMatch>>();
    let mut output = Mat::default();
    features2d::draw_matches(
        img1,
        &to_cv_keypoints(keypoints1)?,
        img2,
        &to_cv_keypoints(keypoints2)?,
        &matches,
        &mut output,
        Scalar::new(0., 255., 0., 0.),
        Scalar::new(255., 0., 0., 0.),
        &Vector::<i8>::new(),
        features2d::DrawMatchesFlags::NOT_DRAW_SINGLE_POINTS,
    )?;
    Ok(output)
}

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .expect("invalid progress template")
        .progress_chars("#>-")
}
