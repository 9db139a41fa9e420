//! 搜索引擎的只读状态：词典、索引、元数据和向量矩阵
//!
//! 四者作为一个整体构建、保存、加载和替换，不会出现新词典搭配旧索引的情况

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Result, bail, ensure};
use log::{debug, info, warn};
use ndarray::prelude::*;
use ndarray_npy::{read_npy, write_npy};
use serde::{Deserialize, Serialize};

use crate::config::{ArtifactPaths, ConfDir};
use crate::corpus::ReferenceEntry;
use crate::index::VladIndex;
use crate::vlad::vlad_dim;
use crate::vocab::Vocabulary;

/// 清单文件，最后写入
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub rows: usize,
    pub k: usize,
    pub dim: usize,
    /// 构建时间（Unix 时间戳，秒）
    pub built_at: u64,
    /// 文件名 -> blake3 哈希
    pub checksums: BTreeMap<String, String>,
}

pub struct EngineState {
    vocab: Vocabulary,
    index: VladIndex,
    entries: Vec<ReferenceEntry>,
    vectors: Array2<f32>,
}

impl EngineState {
    /// 使用词典和逐行对应的元数据、向量矩阵构建状态
    pub fn new(vocab: Vocabulary, entries: Vec<ReferenceEntry>, vectors: Array2<f32>) -> Result<Self> {
        ensure!(
            entries.len() == vectors.nrows(),
            "元数据 {} 行与向量矩阵 {} 行不一致",
            entries.len(),
            vectors.nrows()
        );
        ensure!(vectors.ncols() == vlad_dim(&vocab), "向量维数 {} 与词典不一致", vectors.ncols());
        let index = VladIndex::build(vectors.view())?;
        Ok(Self { vocab, index, entries, vectors })
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn index(&self) -> &VladIndex {
        &self.index
    }

    pub fn entries(&self) -> &[ReferenceEntry] {
        &self.entries
    }

    pub fn vectors(&self) -> ArrayView2<'_, f32> {
        self.vectors.view()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 写入临时目录后整体替换当前的索引文件
    pub fn write(&self, conf_dir: &ConfDir) -> Result<()> {
        fs::create_dir_all(conf_dir.path())?;
        let staging = conf_dir.staging();
        if staging.dir().exists() {
            fs::remove_dir_all(staging.dir())?;
        }
        fs::create_dir_all(staging.dir())?;

        self.vocab.save(staging.vocabulary())?;
        self.index.save(staging.index())?;
        bincode::serialize_into(BufWriter::new(File::create(staging.metadata())?), &self.entries)?;
        write_npy(staging.vectors(), &self.vectors)?;

        let manifest = Manifest {
            rows: self.len(),
            k: self.vocab.k(),
            dim: self.vocab.dim(),
            built_at: SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs(),
            checksums: checksums(&staging)?,
        };
        serde_json::to_writer_pretty(BufWriter::new(File::create(staging.manifest())?), &manifest)?;

        swap_dirs(&staging, &conf_dir.artifacts(), &conf_dir.retired())?;
        info!("索引文件已写入 {}", conf_dir.artifacts().dir().display());
        Ok(())
    }

    /// 加载索引文件，任何一个文件缺失、损坏或与清单不一致都视为不可用
    pub fn read(paths: &ArtifactPaths) -> Result<Self> {
        if !paths.manifest().exists() {
            bail!("清单文件不存在: {}", paths.manifest().display());
        }
        let manifest: Manifest = serde_json::from_reader(BufReader::new(File::open(paths.manifest())?))?;
        ensure!(checksums(paths)? == manifest.checksums, "索引文件校验失败");

        let vocab = Vocabulary::open(paths.vocabulary())?;
        let entries: Vec<ReferenceEntry> =
            bincode::deserialize_from(BufReader::new(File::open(paths.metadata())?))?;
        let vectors: Array2<f32> = read_npy(paths.vectors())?;
        ensure!(
            manifest.rows == entries.len() && manifest.k == vocab.k() && manifest.dim == vocab.dim(),
            "清单与索引文件内容不一致"
        );
        ensure!(vectors.nrows() == entries.len(), "元数据与向量矩阵行数不一致");
        ensure!(vectors.ncols() == vlad_dim(&vocab), "向量维数与词典不一致");

        let index = VladIndex::open(paths.index(), vectors.ncols())?;
        ensure!(index.len() == entries.len(), "索引向量数量与元数据不一致");

        debug!("加载了 {} 条参考记录", entries.len());
        Ok(Self { vocab, index, entries, vectors })
    }

    /// 删除所有索引文件
    pub fn clear(conf_dir: &ConfDir) -> Result<()> {
        for paths in [conf_dir.artifacts(), conf_dir.staging(), conf_dir.retired()] {
            if paths.dir().exists() {
                fs::remove_dir_all(paths.dir())?;
            }
        }
        Ok(())
    }
}

/// 用 staging 替换 current，失败时恢复原来的 current
fn swap_dirs(staging: &ArtifactPaths, current: &ArtifactPaths, retired: &ArtifactPaths) -> Result<()> {
    if retired.dir().exists() {
        fs::remove_dir_all(retired.dir())?;
    }
    let had_current = current.dir().exists();
    if had_current {
        fs::rename(current.dir(), retired.dir())?;
    }
    if let Err(e) = fs::rename(staging.dir(), current.dir()) {
        if had_current {
            if let Err(restore) = fs::rename(retired.dir(), current.dir()) {
                warn!("无法恢复原索引文件 {}: {restore}", retired.dir().display());
            }
        }
        return Err(e.into());
    }
    if retired.dir().exists() {
        fs::remove_dir_all(retired.dir())?;
    }
    Ok(())
}

fn checksums(paths: &ArtifactPaths) -> Result<BTreeMap<String, String>> {
    let mut sums = BTreeMap::new();
    for file in [paths.vocabulary(), paths.index(), paths.metadata(), paths.vectors()] {
        let name = file_name(&file);
        sums.insert(name, blake3::hash(&fs::read(&file)?).to_hex().to_string());
    }
    Ok(sums)
}

fn file_name(path: &Path) -> String {
    path.file_name().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use ndarray::Array;
    use tempfile::TempDir;

    use super::*;
    use crate::config::DESCRIPTOR_DIM;

    fn entry(tid: &str) -> ReferenceEntry {
        ReferenceEntry {
            source_path: PathBuf::from(format!("/d/S/L/{tid}/ref_data/{tid}.jpg")),
            turtle_id: tid.to_string(),
            location: "L".to_string(),
            state: "S".to_string(),
            filename: format!("{tid}.jpg"),
        }
    }

    fn state(rows: usize) -> EngineState {
        let vocab = Vocabulary::from_centers(Array::from_shape_fn((2, DESCRIPTOR_DIM), |(i, j)| (i + j) as f32))
            .unwrap();
        let entries = (0..rows).map(|i| entry(&format!("T{i}"))).collect();
        let vectors = Array::from_shape_fn((rows, 2 * DESCRIPTOR_DIM), |(i, j)| if i == j { 1. } else { 0. });
        EngineState::new(vocab, entries, vectors).unwrap()
    }

    #[test]
    fn test_rejects_misaligned_rows() {
        let vocab = Vocabulary::from_centers(Array2::ones((2, DESCRIPTOR_DIM))).unwrap();
        let vectors = Array2::zeros((2, 2 * DESCRIPTOR_DIM));
        assert!(EngineState::new(vocab, vec![entry("T1")], vectors).is_err());
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let conf = ConfDir::from(dir.path());
        state(3).write(&conf).unwrap();
        assert!(!conf.staging().dir().exists());

        let loaded = EngineState::read(&conf.artifacts()).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.entries()[1].turtle_id, "T1");
        assert_eq!(loaded.vectors(), state(3).vectors());
        // 行号与元数据对应
        let hit = loaded.index().search(loaded.vectors().row(2), 1).unwrap();
        assert_eq!(loaded.entries()[hit[0].row].turtle_id, "T2");
    }

    #[test]
    fn test_write_replaces_previous_set() {
        let dir = TempDir::new().unwrap();
        let conf = ConfDir::from(dir.path());
        state(3).write(&conf).unwrap();
        state(5).write(&conf).unwrap();
        assert_eq!(EngineState::read(&conf.artifacts()).unwrap().len(), 5);
        assert!(!conf.retired().dir().exists());
    }

    #[test]
    fn test_failed_swap_restores_current_set() {
        let dir = TempDir::new().unwrap();
        let conf = ConfDir::from(dir.path());
        state(3).write(&conf).unwrap();

        // staging 目录不存在，重命名必然失败
        assert!(!conf.staging().dir().exists());
        assert!(swap_dirs(&conf.staging(), &conf.artifacts(), &conf.retired()).is_err());

        assert!(!conf.retired().dir().exists());
        assert_eq!(EngineState::read(&conf.artifacts()).unwrap().len(), 3);
    }

    #[test]
    fn test_missing_manifest_is_unusable() {
        let dir = TempDir::new().unwrap();
        let conf = ConfDir::from(dir.path());
        state(2).write(&conf).unwrap();
        fs::remove_file(conf.artifacts().manifest()).unwrap();
        assert!(EngineState::read(&conf.artifacts()).is_err());
    }

    #[test]
    fn test_tampered_file_is_unusable() {
        let dir = TempDir::new().unwrap();
        let conf = ConfDir::from(dir.path());
        state(2).write(&conf).unwrap();
        bincode::serialize_into(File::create(conf.artifacts().metadata()).unwrap(), &vec![entry("X")]).unwrap();
        assert!(EngineState::read(&conf.artifacts()).is_err());
    }

    #[test]
    fn test_clear_removes_everything() {
        let dir = TempDir::new().unwrap();
        let conf = ConfDir::from(dir.path());
        state(2).write(&conf).unwrap();
        fs::create_dir_all(conf.staging().dir()).unwrap();
        EngineState::clear(&conf).unwrap();
        assert!(!conf.artifacts().dir().exists());
        assert!(!conf.staging().dir().exists());
        assert!(EngineState::read(&conf.artifacts()).is_err());
    }
}
