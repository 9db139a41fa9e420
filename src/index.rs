use std::path::Path;

use anyhow::{Result, anyhow, ensure};
use ndarray::prelude::*;
use ndarray::parallel::prelude::*;
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

/// 最近邻搜索结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// 向量在矩阵中的行号
    pub row: usize,
    /// 与查询向量的 L2 平方距离
    pub distance: f32,
}

/// VLAD 向量的最近邻索引，向量的 key 即为它在矩阵中的行号
pub struct VladIndex {
    index: Index,
}

impl VladIndex {
    fn new(dim: usize) -> Result<Self> {
        let options = IndexOptions {
            dimensions: dim,
            metric: MetricKind::L2sq,
            quantization: ScalarKind::F32,
            // 此处为 usearch 默认参数
            connectivity: 32,
            expansion_add: 40,
            expansion_search: 16,
            ..Default::default()
        };
        let index = Index::new(&options)?;
        Ok(Self { index })
    }

    /// 使用 N x D 的向量矩阵构建索引
    pub fn build(vectors: ArrayView2<f32>) -> Result<Self> {
        let s = Self::new(vectors.ncols())?;
        s.index.reserve(vectors.nrows())?;
        let vectors = vectors.as_standard_layout();
        vectors.axis_iter(Axis(0)).into_par_iter().enumerate().try_for_each(|(i, row)| {
            let row = row.as_slice().ok_or_else(|| anyhow!("向量内存不连续"))?;
            s.index.add(i as u64, row)?;
            Ok::<_, anyhow::Error>(())
        })?;
        Ok(s)
    }

    pub fn open<P: AsRef<Path>>(path: P, dim: usize) -> Result<Self> {
        let path = path.as_ref();
        let s = Self::new(dim)?;
        s.index.load(path.to_str().ok_or_else(|| anyhow!("非 UTF-8 路径: {}", path.display()))?)?;
        ensure!(s.index.dimensions() == dim, "索引维数 {} 与词典不一致", s.index.dimensions());
        Ok(s)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.index.save(path.to_str().ok_or_else(|| anyhow!("非 UTF-8 路径: {}", path.display()))?)?;
        Ok(())
    }

    /// 索引中的向量数量
    pub fn len(&self) -> usize {
        self.index.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dim(&self) -> usize {
        self.index.dimensions()
    }

    /// 精确搜索最接近的 k 个向量，按距离从小到大排序
    ///
    /// k 超过索引大小时返回全部向量
    pub fn search(&self, query: ArrayView1<f32>, k: usize) -> Result<Vec<Neighbor>> {
        let k = k.min(self.len());
        if k == 0 {
            return Ok(vec![]);
        }
        ensure!(query.len() == self.dim(), "查询向量维数 {} 与索引 {} 不一致", query.len(), self.dim());
        let query = query.as_standard_layout();
        let query = query.as_slice().ok_or_else(|| anyhow!("向量内存不连续"))?;
        let m = self.index.exact_search(query, k)?;
        let mut result = m
            .keys
            .into_iter()
            .zip(m.distances)
            .map(|(key, distance)| Neighbor { row: key as usize, distance })
            .collect::<Vec<_>>();
        result.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.row.cmp(&b.row)));
        Ok(result)
    }
}
