use std::cmp::Reverse;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use anyhow::Result;
use log::{debug, error, info, warn};
use ndarray::ArrayView1;
use opencv::core::Mat;
use opencv::prelude::*;
use rayon::prelude::*;
use serde::Serialize;

use crate::builder::{self, BuildStats};
use crate::config::{ConfDir, ExtractOptions, SearchOptions, TrainOptions};
use crate::corpus::ReferenceEntry;
use crate::feature::{FeatureSet, SiftExtractor};
use crate::index::Neighbor;
use crate::sidecar;
use crate::state::EngineState;
use crate::verify::SpatialVerifier;
use crate::{metrics, utils, vlad};

/// 一条搜索结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub turtle_id: String,
    pub location: String,
    pub state: String,
    pub source_path: PathBuf,
    pub filename: String,
    /// 与查询的 VLAD 向量之间的 L2 平方距离
    pub distance: f32,
    /// 空间验证内点数
    pub spatial_score: usize,
    /// 结果来自镜像后的查询图片
    pub mirrored: bool,
}

impl Candidate {
    fn new(entry: &ReferenceEntry, distance: f32) -> Self {
        Self {
            turtle_id: entry.turtle_id.clone(),
            location: entry.location.clone(),
            state: entry.state.clone(),
            source_path: entry.source_path.clone(),
            filename: entry.filename.clone(),
            distance,
            spatial_score: 0,
            mirrored: false,
        }
    }
}

/// 重建结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RebuildReport {
    /// 新的索引已写入并生效
    Built(BuildStats),
    /// 没有可用的描述符，没有生成词典，原有索引保持不变
    NoVocabulary(BuildStats),
}

pub struct EngineBuilder {
    conf_dir: ConfDir,
    extract: ExtractOptions,
    train: TrainOptions,
    search: SearchOptions,
}

impl EngineBuilder {
    pub fn new(conf_dir: ConfDir) -> Self {
        Self {
            conf_dir,
            extract: ExtractOptions::default(),
            train: TrainOptions::default(),
            search: SearchOptions::default(),
        }
    }

    pub fn extract(mut self, extract: ExtractOptions) -> Self {
        self.extract = extract;
        self
    }

    pub fn train(mut self, train: TrainOptions) -> Self {
        self.train = train;
        self
    }

    pub fn search(mut self, search: SearchOptions) -> Self {
        self.search = search;
        self
    }

    /// 打开搜索引擎，索引文件不可用时引擎处于未就绪状态
    pub fn open(self) -> Engine {
        let state = match EngineState::read(&self.conf_dir.artifacts()) {
            Ok(state) => {
                info!("加载索引成功，共 {} 张参考图片", state.len());
                Some(Arc::new(state))
            }
            Err(e) => {
                debug!("索引不可用: {e}");
                None
            }
        };
        Engine {
            conf_dir: self.conf_dir,
            extract: self.extract,
            train: self.train,
            search: self.search,
            state: RwLock::new(state),
            rebuild_lock: Mutex::new(()),
        }
    }
}

/// 海龟腹甲识别引擎
///
/// 搜索只读取当前状态的快照，重建完成后整体替换状态，读者不会看到新旧混合的数据
pub struct Engine {
    conf_dir: ConfDir,
    extract: ExtractOptions,
    train: TrainOptions,
    search: SearchOptions,
    state: RwLock<Option<Arc<EngineState>>>,
    rebuild_lock: Mutex<()>,
}

impl Engine {
    pub fn extract_options(&self) -> &ExtractOptions {
        &self.extract
    }

    /// 当前状态的快照
    pub fn state(&self) -> Option<Arc<EngineState>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_some_and(|s| !s.is_empty())
    }

    fn swap(&self, state: Option<Arc<EngineState>>) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// 索引不可用时重建，启动时调用
    pub fn ensure_ready(&self, root: &Path) -> Result<Option<RebuildReport>> {
        if self.state().is_some() {
            return Ok(None);
        }
        info!("索引文件缺失或不可读，开始重建");
        self.rebuild(root).map(Some)
    }

    /// 重建词典和索引
    ///
    /// 同一时间只有一个重建在执行；失败或没有可用描述符时保留原有的索引文件和内存状态
    pub fn rebuild(&self, root: &Path) -> Result<RebuildReport> {
        let _guard = self.rebuild_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let start = Instant::now();

        let prior = self.state();
        let result = builder::build(root, &self.extract, &self.train, prior.as_ref().map(|s| s.vocab()));
        let (stats, state) = match result {
            Ok(built) => built,
            Err(e) => {
                error!("重建失败: {e}");
                return Err(e);
            }
        };

        let Some(state) = state else {
            warn!("没有生成词典，保留原有索引");
            return Ok(RebuildReport::NoVocabulary(stats));
        };
        if let Err(e) = state.write(&self.conf_dir) {
            error!("写入索引文件失败: {e}");
            return Err(e);
        }
        self.swap(Some(Arc::new(state)));

        let elapsed = start.elapsed().as_secs_f32();
        metrics::observe_rebuild_duration(elapsed);
        info!("重建完成，耗时 {elapsed:.2}s");
        Ok(RebuildReport::Built(stats))
    }

    /// 删除全部索引文件，并清空内存中的状态
    pub fn clear(&self) -> Result<()> {
        let _guard = self.rebuild_lock.lock().unwrap_or_else(PoisonError::into_inner);
        EngineState::clear(&self.conf_dir)?;
        self.swap(None);
        Ok(())
    }

    pub fn search_file(&self, path: impl AsRef<Path>, location: Option<&str>) -> Vec<Candidate> {
        match utils::imread(path.as_ref()) {
            Ok(image) => self.search_image(image, location),
            Err(e) => {
                warn!("无法读取查询图片: {e}");
                vec![]
            }
        }
    }

    pub fn search_bytes(&self, bytes: &[u8], location: Option<&str>) -> Vec<Candidate> {
        match utils::imdecode(bytes) {
            Ok(image) => self.search_image(image, location),
            Err(e) => {
                warn!("无法解码查询图片: {e}");
                vec![]
            }
        }
    }

    /// 搜索一张灰度图片，返回按空间验证分数排序的结果
    ///
    /// 最佳分数低于阈值时水平镜像查询图片再搜索一次，取分数更高的一组。
    /// 没有索引、没有特征点等情况都返回空列表
    pub fn search_image(&self, image: Mat, location: Option<&str>) -> Vec<Candidate> {
        let Some(state) = self.state().filter(|s| !s.is_empty()) else {
            debug!("索引未就绪");
            return vec![];
        };
        let location = location.map(str::trim).filter(|s| !s.is_empty());
        let start = Instant::now();

        let normal = self.search_pass(&state, &image, location).unwrap_or_else(|e| {
            warn!("搜索失败: {e}");
            vec![]
        });
        let mut result = select_orientation(
            normal,
            || self.search_pass(&state, &utils::mirror(&image)?, location),
            self.search.mirror_threshold,
        );
        result.truncate(self.search.count);

        let elapsed = start.elapsed().as_secs_f32();
        let top = result.first().map(|c| c.spatial_score).unwrap_or(0);
        let mirrored = result.first().is_some_and(|c| c.mirrored);
        metrics::observe_search(elapsed, top, mirrored);
        debug!("搜索耗时 {elapsed:.2}s，最高分 {top}");
        result
    }

    /// 单个方向的搜索：VLAD 初筛后空间验证重排
    fn search_pass(&self, state: &EngineState, image: &Mat, location: Option<&str>) -> Result<Vec<Candidate>> {
        let mut extractor = SiftExtractor::create(self.extract.clone())?;
        let Some(query) = extractor.extract(image.try_clone()?)? else {
            debug!("查询图片没有特征点");
            return Ok(vec![]);
        };
        let vector = vlad::encode(&query, state.vocab());
        let shortlist = shortlist(state, vector.view(), location, self.search.verify_top)?;
        debug!("初筛得到 {} 个候选", shortlist.len());
        Ok(self.verify(&query, shortlist))
    }

    /// 并行计算每个候选的空间验证分数，无法获取特征的候选被丢弃
    fn verify(&self, query: &FeatureSet, shortlist: Vec<Candidate>) -> Vec<Candidate> {
        let cap = self.extract.max_keypoints;
        let mut verified = shortlist
            .into_par_iter()
            .map_init(
                || (SpatialVerifier::create(&self.search), None::<SiftExtractor>),
                |(verifier, extractor), mut candidate| {
                    let verifier = match verifier {
                        Ok(verifier) => verifier,
                        Err(e) => {
                            warn!("无法创建匹配器: {e}");
                            return None;
                        }
                    };
                    let features = self.candidate_features(&candidate.source_path, cap, extractor)?;
                    match verifier.score(query, &features) {
                        Ok(score) => candidate.spatial_score = score,
                        Err(e) => warn!("空间验证失败 {}: {e}", candidate.source_path.display()),
                    }
                    Some(candidate)
                },
            )
            .flatten()
            .collect::<Vec<_>>();
        // 稳定排序，同分时保持 VLAD 距离顺序
        verified.sort_by_key(|c| Reverse(c.spatial_score));
        verified
    }

    /// 优先读取特征文件，失败时从原图重新提取
    fn candidate_features(
        &self,
        image: &Path,
        cap: usize,
        extractor: &mut Option<SiftExtractor>,
    ) -> Option<FeatureSet> {
        if let Some(features) = sidecar::load(&sidecar::sidecar_path(image), cap) {
            return Some(features);
        }
        if extractor.is_none() {
            *extractor = SiftExtractor::create(self.extract.clone()).ok();
        }
        match extractor.as_mut()?.extract_file(image) {
            Ok(Some(features)) => Some(features),
            Ok(None) => {
                warn!("候选图片没有特征点，跳过: {}", image.display());
                None
            }
            Err(e) => {
                warn!("无法读取候选图片，跳过 {}: {e}", image.display());
                None
            }
        }
    }
}

/// 最近邻初筛，返回最多 limit 只不同海龟的候选
///
/// 带地点过滤时多取一些近邻；过滤后没有结果时退回到不过滤的搜索
pub fn shortlist(
    state: &EngineState,
    query: ArrayView1<f32>,
    location: Option<&str>,
    limit: usize,
) -> Result<Vec<Candidate>> {
    let factor = if location.is_some() { 10 } else { 5 };
    let neighbors = state.index().search(query, limit * factor)?;
    let candidates = dedup_candidates(&neighbors, state.entries(), location, limit);
    if candidates.is_empty() && location.is_some() {
        debug!("地点过滤后没有候选，改为搜索全部地点");
        return shortlist(state, query, None, limit);
    }
    Ok(candidates)
}

/// 按距离顺序过滤地点并按海龟 ID 去重，只保留每只海龟最近的一条
pub fn dedup_candidates(
    neighbors: &[Neighbor],
    entries: &[ReferenceEntry],
    location: Option<&str>,
    limit: usize,
) -> Vec<Candidate> {
    let mut result: Vec<Candidate> = vec![];
    for n in neighbors {
        if result.len() >= limit {
            break;
        }
        let Some(entry) = entries.get(n.row) else {
            continue;
        };
        if location.is_some_and(|loc| !entry.matches_location(loc)) {
            continue;
        }
        if result.iter().any(|c| c.turtle_id == entry.turtle_id) {
            continue;
        }
        result.push(Candidate::new(entry, n.distance));
    }
    result
}

/// 决定使用正常方向还是镜像方向的结果
///
/// 正常方向最佳分数达到阈值时不执行镜像搜索；镜像结果只有严格更高时才会被采用，并被标记为镜像
pub fn select_orientation<F>(normal: Vec<Candidate>, mirrored: F, threshold: usize) -> Vec<Candidate>
where
    F: FnOnce() -> Result<Vec<Candidate>>,
{
    let best_normal = normal.first().map(|c| c.spatial_score).unwrap_or(0);
    if best_normal >= threshold {
        return normal;
    }
    debug!("最佳分数 {best_normal} 低于阈值 {threshold}，尝试镜像搜索");

    let mut mirrored = match mirrored() {
        Ok(mirrored) => mirrored,
        Err(e) => {
            warn!("镜像搜索失败: {e}");
            return normal;
        }
    };
    let best_mirrored = mirrored.first().map(|c| c.spatial_score).unwrap_or(0);
    debug!("正常方向: {best_normal}，镜像方向: {best_mirrored}");
    if best_mirrored > best_normal {
        mirrored.iter_mut().for_each(|c| c.mirrored = true);
        mirrored
    } else {
        normal
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;

    fn entry(tid: &str, location: &str, state: &str) -> ReferenceEntry {
        ReferenceEntry {
            source_path: PathBuf::from(format!("/d/{state}/{location}/{tid}/ref_data/{tid}.jpg")),
            turtle_id: tid.to_string(),
            location: location.to_string(),
            state: state.to_string(),
            filename: format!("{tid}.jpg"),
        }
    }

    fn scored(tid: &str, score: usize) -> Candidate {
        Candidate { spatial_score: score, ..Candidate::new(&entry(tid, "L", "S"), 0.) }
    }

    fn neighbors(rows: &[usize]) -> Vec<Neighbor> {
        rows.iter().enumerate().map(|(i, &row)| Neighbor { row, distance: i as f32 }).collect()
    }

    #[test]
    fn test_dedup_keeps_closest_per_turtle() {
        let entries = vec![entry("T1", "A", "S"), entry("T2", "A", "S"), entry("T1", "B", "S")];
        let result = dedup_candidates(&neighbors(&[2, 1, 0]), &entries, None, 10);
        let ids = result.iter().map(|c| c.turtle_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["T1", "T2"]);
        assert_eq!(result[0].location, "B");
    }

    #[test]
    fn test_dedup_respects_limit() {
        let entries = (0..10).map(|i| entry(&format!("T{i}"), "A", "S")).collect::<Vec<_>>();
        assert_eq!(dedup_candidates(&neighbors(&[0, 1, 2, 3, 4, 5]), &entries, None, 3).len(), 3);
    }

    #[test]
    fn test_location_filter_matches_state_or_location() {
        let entries = vec![entry("T1", "Topeka", "Nebraska"), entry("T2", "Karlyle", "Kansas")];
        let by_state = dedup_candidates(&neighbors(&[0, 1]), &entries, Some("Kansas"), 10);
        assert_eq!(by_state.len(), 1);
        assert_eq!(by_state[0].turtle_id, "T2");
        let by_location = dedup_candidates(&neighbors(&[0, 1]), &entries, Some("Topeka"), 10);
        assert_eq!(by_location[0].turtle_id, "T1");
        assert!(dedup_candidates(&neighbors(&[0, 1]), &entries, Some("Ohio"), 10).is_empty());
    }

    #[test]
    fn test_confident_normal_skips_mirror() {
        let normal = vec![scored("T1", 40)];
        let result = select_orientation(normal.clone(), || panic!("mirror must not run"), 15);
        assert_eq!(result, normal);
    }

    #[test]
    fn test_better_mirror_wins_and_is_flagged() {
        let result = select_orientation(vec![scored("T1", 3)], || Ok(vec![scored("T2", 30), scored("T3", 2)]), 15);
        assert_eq!(result[0].turtle_id, "T2");
        assert!(result.iter().all(|c| c.mirrored));
    }

    #[test]
    fn test_equal_mirror_keeps_normal() {
        let result = select_orientation(vec![scored("T1", 5)], || Ok(vec![scored("T2", 5)]), 15);
        assert_eq!(result[0].turtle_id, "T1");
        assert!(!result[0].mirrored);
    }

    #[test]
    fn test_failed_mirror_keeps_normal() {
        let result = select_orientation(vec![scored("T1", 5)], || Err(anyhow!("boom")), 15);
        assert_eq!(result[0].turtle_id, "T1");
    }

    #[test]
    fn test_empty_normal_uses_mirror() {
        let result = select_orientation(vec![], || Ok(vec![scored("T2", 1)]), 15);
        assert!(result[0].mirrored);
    }
}
