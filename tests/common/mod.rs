#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use opencv::core::{self, CV_8UC1, Mat, Point, Point2f, Rect, Scalar, Size};
use opencv::imgproc;
use opencv::prelude::*;
use rand::prelude::*;
use rand::rngs::StdRng;

use plastron::utils;

pub const SIZE: i32 = 640;

/// 用随机图形生成一张不对称的“腹甲”图片
pub fn synthetic(seed: u64) -> Result<Mat> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut img = Mat::new_rows_cols_with_default(SIZE, SIZE, CV_8UC1, Scalar::all(90.))?;
    let color = |rng: &mut StdRng| Scalar::all(rng.random_range(0.0..255.0));

    for _ in 0..40 {
        let (x, y) = (rng.random_range(0..SIZE), rng.random_range(0..SIZE));
        let (w, h) = (rng.random_range(10..120), rng.random_range(10..120));
        let c = color(&mut rng);
        imgproc::rectangle(&mut img, Rect::new(x, y, w, h), c, -1, imgproc::LINE_8, 0)?;
    }
    for _ in 0..40 {
        let center = Point::new(rng.random_range(0..SIZE), rng.random_range(0..SIZE));
        let radius = rng.random_range(5..60);
        let c = color(&mut rng);
        imgproc::circle(&mut img, center, radius, c, rng.random_range(1..6), imgproc::LINE_8, 0)?;
    }
    for _ in 0..40 {
        let p1 = Point::new(rng.random_range(0..SIZE), rng.random_range(0..SIZE));
        let p2 = Point::new(rng.random_range(0..SIZE), rng.random_range(0..SIZE));
        let c = color(&mut rng);
        imgproc::line(&mut img, p1, p2, c, rng.random_range(1..4), imgproc::LINE_8, 0)?;
    }
    for _ in 0..400 {
        let center = Point::new(rng.random_range(0..SIZE), rng.random_range(0..SIZE));
        let c = color(&mut rng);
        imgproc::circle(&mut img, center, rng.random_range(1..4), c, -1, imgproc::LINE_8, 0)?;
    }
    for i in 0..4 {
        let org = Point::new(rng.random_range(0..SIZE - 150), 100 + i * 140);
        let c = color(&mut rng);
        imgproc::put_text(&mut img, "R7X", org, imgproc::FONT_HERSHEY_SIMPLEX, 2.0, c, 3, imgproc::LINE_8, false)?;
    }
    Ok(img)
}

/// 旋转后裁剪，模拟同一只海龟的另一张照片
pub fn rotate_and_crop(img: &Mat, angle: f64) -> Result<Mat> {
    let center = Point2f::new(SIZE as f32 / 2., SIZE as f32 / 2.);
    let m = imgproc::get_rotation_matrix_2d(center, angle, 1.0)?;
    let mut rotated = Mat::default();
    imgproc::warp_affine(
        img,
        &mut rotated,
        &m,
        Size::new(SIZE, SIZE),
        imgproc::INTER_LINEAR,
        core::BORDER_CONSTANT,
        Scalar::all(90.),
    )?;
    let roi = Mat::roi(&rotated, Rect::new(60, 60, SIZE - 120, SIZE - 120))?;
    Ok(roi.try_clone()?)
}

pub fn mirror(img: &Mat) -> Result<Mat> {
    Ok(utils::mirror(img)?)
}

pub fn blank() -> Result<Mat> {
    Ok(Mat::new_rows_cols_with_default(SIZE, SIZE, CV_8UC1, Scalar::all(128.))?)
}

/// 每个像素独立随机的噪声图片，不属于任何一只海龟
pub fn noise(seed: u64) -> Result<Mat> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut img = Mat::new_rows_cols_with_default(SIZE, SIZE, CV_8UC1, Scalar::all(0.))?;
    for r in 0..SIZE {
        for c in 0..SIZE {
            *img.at_2d_mut::<u8>(r, c)? = rng.random();
        }
    }
    Ok(img)
}

/// 写入 `<root>/<state>/<location>/<tid>/ref_data/<name>`
pub fn put_reference(root: &Path, state: &str, location: &str, tid: &str, name: &str, img: &Mat) -> Result<PathBuf> {
    let dir = root.join(state).join(location).join(tid).join("ref_data");
    fs::create_dir_all(&dir)?;
    let path = dir.join(name);
    utils::imwrite(&path, img)?;
    Ok(path)
}

/// 三只海龟 T1、T2、T3，每只一张参考图片
pub fn three_turtles(root: &Path) -> Result<()> {
    put_reference(root, "Kansas", "Karlyle", "T1", "T1.png", &synthetic(1)?)?;
    put_reference(root, "Kansas", "Karlyle", "T2", "T2.png", &synthetic(2)?)?;
    put_reference(root, "Nebraska", "Topeka", "T3", "T3.png", &synthetic(3)?)?;
    Ok(())
}
