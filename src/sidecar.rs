//! 每张参考图片旁边保存的特征文件（`<图片文件名>.npz`，如 `T1.jpg.npz`），避免重复提取特征

use std::fs::{self, File};
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

use anyhow::{Result, ensure};
use log::debug;
use ndarray::{Array1, Array2, ArrayBase, DataOwned, Dimension};
use ndarray_npy::{NpzReader, NpzWriter, ReadableElement};

use crate::feature::{FeatureSet, Keypoint};

const KEYPOINTS: &str = "keypoints";
const KEYPOINT_IDS: &str = "keypoint_ids";
const DESCRIPTORS: &str = "descriptors";
const SOURCE_HASH: &str = "source_hash";

/// 图片对应的特征文件路径
///
/// 保留图片的扩展名，同一目录下的 `T1.jpg` 和 `T1.png` 不会共用一个特征文件
pub fn sidecar_path(image: &Path) -> PathBuf {
    let mut path = image.as_os_str().to_owned();
    path.push(".npz");
    PathBuf::from(path)
}

/// 保存特征，同时记录源图片的哈希用于判断特征文件是否过期
pub fn save(path: &Path, features: &FeatureSet, source_hash: &blake3::Hash) -> Result<()> {
    let n = features.len();
    let mut keypoints = Array2::<f32>::zeros((n, 5));
    let mut keypoint_ids = Array2::<i32>::zeros((n, 2));
    for (i, kp) in features.keypoints().iter().enumerate() {
        keypoints.row_mut(i).assign(&Array1::from(vec![kp.x, kp.y, kp.size, kp.angle, kp.response]));
        keypoint_ids[[i, 0]] = kp.octave;
        keypoint_ids[[i, 1]] = kp.class_id;
    }
    let hash = Array1::from(source_hash.as_bytes().to_vec());

    // 先写入临时文件再重命名，避免留下写了一半的特征文件
    let tmp = path.with_extension("npz.tmp");
    let mut npz = NpzWriter::new_compressed(File::create(&tmp)?);
    npz.add_array(KEYPOINTS, &keypoints)?;
    npz.add_array(KEYPOINT_IDS, &keypoint_ids)?;
    npz.add_array(DESCRIPTORS, &features.descriptors())?;
    npz.add_array(SOURCE_HASH, &hash)?;
    npz.finish()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// 读取特征文件，文件不存在或损坏时返回 None，由调用方决定是否重新提取
///
/// 旧版本的特征文件可能没有数量限制，这里同样按 cap 抽样
pub fn load(path: &Path, cap: usize) -> Option<FeatureSet> {
    match try_load(path) {
        Ok(features) => Some(features.truncate(cap)),
        Err(e) => {
            debug!("无法读取特征文件 {}: {e}", path.display());
            None
        }
    }
}

/// 读取特征文件中记录的源图片哈希，旧版本文件没有记录时返回 None
pub fn source_hash(path: &Path) -> Option<blake3::Hash> {
    let mut npz = NpzReader::new(File::open(path).ok()?).ok()?;
    let hash: Array1<u8> = read_array(&mut npz, SOURCE_HASH).ok()?;
    let bytes: [u8; 32] = hash.as_slice()?.try_into().ok()?;
    Some(blake3::Hash::from_bytes(bytes))
}

/// 特征文件状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidecarStatus {
    /// 特征文件存在且与图片一致
    Fresh,
    /// 特征文件不存在或无法读取
    Missing,
    /// 图片内容已变化
    Stale,
}

/// 检查图片的特征文件是否需要重新生成
///
/// 哈希一致但特征点或描述符无法读取（维数错误、数据不完整）的文件同样需要重新生成
pub fn status(image_hash: &blake3::Hash, sidecar: &Path) -> SidecarStatus {
    if !sidecar.exists() {
        return SidecarStatus::Missing;
    }
    if let Err(e) = try_load(sidecar) {
        debug!("特征文件 {} 不可用: {e}", sidecar.display());
        return SidecarStatus::Missing;
    }
    match source_hash(sidecar) {
        Some(hash) if hash == *image_hash => SidecarStatus::Fresh,
        Some(_) => SidecarStatus::Stale,
        // 没有记录哈希的旧文件，内容可读就认为有效
        None => SidecarStatus::Fresh,
    }
}

fn try_load(path: &Path) -> Result<FeatureSet> {
    let mut npz = NpzReader::new(File::open(path)?)?;
    let keypoints: Array2<f32> = read_array(&mut npz, KEYPOINTS)?;
    let keypoint_ids: Array2<i32> = read_array(&mut npz, KEYPOINT_IDS)?;
    let descriptors: Array2<f32> = read_array(&mut npz, DESCRIPTORS)?;

    ensure!(keypoints.ncols() == 5 && keypoint_ids.ncols() == 2, "特征点格式错误");
    ensure!(keypoints.nrows() == keypoint_ids.nrows(), "特征点数据长度不一致");

    let keypoints = keypoints
        .rows()
        .into_iter()
        .zip(keypoint_ids.rows())
        .map(|(kp, ids)| Keypoint {
            x: kp[0],
            y: kp[1],
            size: kp[2],
            angle: kp[3],
            response: kp[4],
            octave: ids[0],
            class_id: ids[1],
        })
        .collect();
    FeatureSet::new(keypoints, descriptors)
}

/// 不同版本的 npz 读取器对 `.npy` 后缀的处理不同，两种名字都尝试一次
fn read_array<R, A, S, D>(npz: &mut NpzReader<R>, name: &str) -> Result<ArrayBase<S, D>>
where
    R: Read + Seek,
    A: ReadableElement,
    S: DataOwned<Elem = A>,
    D: Dimension,
{
    match npz.by_name(name) {
        Ok(array) => Ok(array),
        Err(_) => Ok(npz.by_name(&format!("{name}.npy"))?),
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array;
    use tempfile::TempDir;

    use super::*;
    use crate::config::DESCRIPTOR_DIM;

    fn features(n: usize) -> FeatureSet {
        let keypoints = (0..n)
            .map(|i| Keypoint {
                x: i as f32,
                y: 2. * i as f32,
                size: 3.,
                angle: 45.,
                response: 0.5,
                octave: 0x10001 * i as i32,
                class_id: -1,
            })
            .collect();
        let descriptors = Array::from_shape_fn((n, DESCRIPTOR_DIM), |(i, j)| (i * j) as f32);
        FeatureSet::new(keypoints, descriptors).unwrap()
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("T101.jpg.npz");
        let original = features(20);
        save(&path, &original, &blake3::hash(b"image")).unwrap();

        let loaded = load(&path, 15000).unwrap();
        assert_eq!(loaded.keypoints(), original.keypoints());
        assert_eq!(loaded.descriptors(), original.descriptors());
        assert_eq!(source_hash(&path), Some(blake3::hash(b"image")));
    }

    #[test]
    fn test_load_applies_cap() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("T101.jpg.npz");
        save(&path, &features(50), &blake3::hash(b"image")).unwrap();
        assert_eq!(load(&path, 10).unwrap().len(), 10);
    }

    #[test]
    fn test_missing_or_corrupt_is_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.npz");
        assert!(load(&path, 15000).is_none());

        let corrupt = dir.path().join("corrupt.npz");
        fs::write(&corrupt, b"definitely not a zip archive").unwrap();
        assert!(load(&corrupt, 15000).is_none());
        assert_eq!(status(&blake3::hash(b"x"), &corrupt), SidecarStatus::Missing);
    }

    #[test]
    fn test_status_detects_changed_image() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("T101.jpg.npz");
        save(&path, &features(3), &blake3::hash(b"old")).unwrap();
        assert_eq!(status(&blake3::hash(b"old"), &path), SidecarStatus::Fresh);
        assert_eq!(status(&blake3::hash(b"new"), &path), SidecarStatus::Stale);
        assert_eq!(status(&blake3::hash(b"old"), &dir.path().join("none.npz")), SidecarStatus::Missing);
    }

    #[test]
    fn test_status_rejects_unreadable_descriptors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("T101.jpg.npz");
        let hash = blake3::hash(b"image");

        // 哈希匹配，但描述符只有 64 维
        let mut npz = NpzWriter::new_compressed(File::create(&path).unwrap());
        npz.add_array(KEYPOINTS, &Array2::<f32>::zeros((3, 5))).unwrap();
        npz.add_array(KEYPOINT_IDS, &Array2::<i32>::zeros((3, 2))).unwrap();
        npz.add_array(DESCRIPTORS, &Array2::<f32>::zeros((3, 64))).unwrap();
        npz.add_array(SOURCE_HASH, &Array1::from(hash.as_bytes().to_vec())).unwrap();
        npz.finish().unwrap();

        assert_eq!(source_hash(&path), Some(hash));
        assert!(load(&path, 15000).is_none());
        assert_eq!(status(&hash, &path), SidecarStatus::Missing);
    }

    #[test]
    fn test_status_rejects_missing_keypoints() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("T101.jpg.npz");
        let hash = blake3::hash(b"image");

        let mut npz = NpzWriter::new_compressed(File::create(&path).unwrap());
        npz.add_array(DESCRIPTORS, &Array2::<f32>::zeros((3, DESCRIPTOR_DIM))).unwrap();
        npz.add_array(SOURCE_HASH, &Array1::from(hash.as_bytes().to_vec())).unwrap();
        npz.finish().unwrap();

        assert_ne!(status(&hash, &path), SidecarStatus::Fresh);
    }

    #[test]
    fn test_sidecar_path() {
        assert_eq!(sidecar_path(Path::new("/a/ref_data/T101.jpg")), PathBuf::from("/a/ref_data/T101.jpg.npz"));
        assert_ne!(sidecar_path(Path::new("/a/T1.jpg")), sidecar_path(Path::new("/a/T1.png")));
    }

    #[test]
    fn test_same_stem_sidecars_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let jpg = sidecar_path(&dir.path().join("T1.jpg"));
        let png = sidecar_path(&dir.path().join("T1.png"));
        save(&jpg, &features(4), &blake3::hash(b"jpg")).unwrap();
        save(&png, &features(7), &blake3::hash(b"png")).unwrap();

        assert_eq!(status(&blake3::hash(b"jpg"), &jpg), SidecarStatus::Fresh);
        assert_eq!(status(&blake3::hash(b"png"), &png), SidecarStatus::Fresh);
        assert_eq!(load(&jpg, 15000).unwrap().len(), 4);
        assert_eq!(load(&png, 15000).unwrap().len(), 7);
    }
}
