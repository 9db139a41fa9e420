//! 参考图片目录：`<根目录>/<州>/<地点>/<海龟 ID>/ref_data/<图片>`
//!
//! 海龟 ID、地点和州全部由目录层级决定，解析规则集中在 [`parse_reference_entry`] 中

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Result, anyhow, bail};
use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use walkdir::{DirEntry, WalkDir};

use crate::feature::SiftExtractor;
use crate::sidecar;

/// 参考图片所在目录
pub const REF_DIR: &str = "ref_data";
/// 观察图片所在目录，不参与索引
pub const LOOSE_DIR: &str = "loose_images";
/// 根目录下不包含参考图片的特殊目录
pub const SPECIAL_FOLDERS: [&str; 3] = ["Review_Queue", "Community_Uploads", "Incidental_Finds"];

const UNKNOWN: &str = "Unknown";

static RE_IMAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("(?i)^(jpg|jpeg|png)$").expect("failed to build regex"));

/// 索引中的一行元数据，与向量矩阵的同一行对应
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceEntry {
    pub source_path: PathBuf,
    pub turtle_id: String,
    pub location: String,
    pub state: String,
    pub filename: String,
}

impl ReferenceEntry {
    /// 地点过滤条件可以是地点目录名，也可以是州目录名
    pub fn matches_location(&self, filter: &str) -> bool {
        self.location == filter || self.state == filter
    }
}

/// 根据图片相对于根目录的路径解析出海龟 ID、地点和州
///
/// `ref_data` 的上一级是海龟 ID，上两级是地点，上三级是州。
/// 旧的 `<州>/<海龟 ID>/ref_data` 结构没有地点这一级，此时地点和州相同。
/// 图片不在根目录下，或者不直接位于 `ref_data` 中时返回 None
pub fn parse_reference_entry(root: &Path, image: &Path) -> Option<ReferenceEntry> {
    let rel = image.strip_prefix(root).ok()?;
    let parts = rel
        .components()
        .map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;

    let idx = parts.iter().position(|p| p == REF_DIR)?;
    if idx == 0 || idx + 2 != parts.len() {
        return None;
    }

    let turtle_id = parts[idx - 1].clone();
    let location = if idx >= 2 { parts[idx - 2].clone() } else { UNKNOWN.to_string() };
    let state = if idx >= 3 { parts[idx - 3].clone() } else { location.clone() };

    Some(ReferenceEntry {
        source_path: image.to_path_buf(),
        turtle_id,
        location,
        state,
        filename: parts[idx + 1].clone(),
    })
}

pub fn is_image(path: &Path) -> bool {
    path.extension().map(|s| RE_IMAGE.is_match(&s.to_string_lossy())) == Some(true)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_str().map(|s| s.starts_with('.')).unwrap_or(false)
}

fn is_special(entry: &DirEntry) -> bool {
    entry.depth() == 1 && SPECIAL_FOLDERS.iter().any(|s| entry.file_name() == *s)
}

/// 扫描根目录下所有参考图片，按路径排序
pub fn scan_references(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        bail!("参考图片目录不存在: {}", root.display());
    }

    let mut images = vec![];
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !(is_hidden(e) || is_special(e)));
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("无法访问目录项: {e}");
                continue;
            }
        };
        let path = entry.path();
        if !entry.file_type().is_file() || !is_image(path) {
            continue;
        }
        if path.parent().and_then(|p| p.file_name()).map(|n| n == REF_DIR) != Some(true) {
            continue;
        }
        images.push(entry.into_path());
    }
    debug!("在 {} 中找到 {} 张参考图片", root.display(), images.len());
    Ok(images)
}

/// 列出根目录下所有 `州/地点`
pub fn list_locations(root: &Path) -> Result<Vec<String>> {
    let mut locations = vec![];
    for state in sorted_dirs(root)? {
        let state_name = state.file_name().to_string_lossy().into_owned();
        if SPECIAL_FOLDERS.contains(&state_name.as_str()) {
            continue;
        }
        for location in sorted_dirs(state.path())? {
            locations.push(format!("{}/{}", state_name, location.file_name().to_string_lossy()));
        }
    }
    Ok(locations)
}

fn sorted_dirs(path: &Path) -> Result<Vec<DirEntry>> {
    let mut dirs = vec![];
    for entry in WalkDir::new(path).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_dir() && !is_hidden(&entry) {
            dirs.push(entry);
        }
    }
    Ok(dirs)
}

/// 从文件名提取海龟 ID：主文件名的前 4 个字符（字母 + 3 位数字），去掉结尾的下划线
///
/// 例：`T101_2024.jpg` -> `T101`，`F12_a.jpg` -> `F12`
pub fn turtle_id_from_filename(filename: &str) -> Option<String> {
    let stem = Path::new(filename).file_stem()?.to_string_lossy();
    let id = stem.chars().take(4).collect::<String>();
    let id = id.trim().trim_end_matches('_');
    if id.is_empty() { None } else { Some(id.to_string()) }
}

/// 单张参考图片的导入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// 新建了参考图片和特征文件
    Created,
    /// 该地点下已经存在这只海龟的特征文件
    Skipped,
    /// 图片无法解码或没有特征点
    Failed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    pub created: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl IngestReport {
    fn record(&mut self, outcome: IngestOutcome) {
        match outcome {
            IngestOutcome::Created => self.created += 1,
            IngestOutcome::Skipped => self.skipped += 1,
            IngestOutcome::Failed => self.failed += 1,
        }
    }
}

/// 将图片作为海龟的参考图片导入 `<地点目录>/<海龟 ID>/ref_data/<海龟 ID>.<后缀>`
///
/// 特征文件已存在时跳过，同一地点下每只海龟只保留第一张参考图片
pub fn ingest_reference(
    extractor: &mut SiftExtractor,
    image: &Path,
    location_dir: &Path,
    turtle_id: &str,
) -> Result<IngestOutcome> {
    let turtle_dir = location_dir.join(turtle_id);
    let ref_dir = turtle_dir.join(REF_DIR);
    fs::create_dir_all(&ref_dir)?;
    fs::create_dir_all(turtle_dir.join(LOOSE_DIR))?;

    if has_reference(&ref_dir, turtle_id)? {
        debug!("跳过已存在的海龟: {}", turtle_dir.display());
        return Ok(IngestOutcome::Skipped);
    }

    let ext = image.extension().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let dest = ref_dir.join(turtle_id).with_extension(ext);
    let dest_sidecar = sidecar::sidecar_path(&dest);

    let data = fs::read(image)?;
    fs::write(&dest, &data)?;

    let features = match extractor.extract_bytes(&data) {
        Ok(Some(features)) => features,
        Ok(None) => {
            warn!("图片没有特征点: {}", image.display());
            return Ok(IngestOutcome::Failed);
        }
        Err(e) => {
            warn!("无法提取特征 {}: {e}", image.display());
            return Ok(IngestOutcome::Failed);
        }
    };
    sidecar::save(&dest_sidecar, &features, &blake3::hash(&data))?;
    info!("导入新海龟: {} ({} 个特征点)", turtle_id, features.len());
    Ok(IngestOutcome::Created)
}

/// `ref_data` 中是否已有该海龟的参考图片及其特征文件，后缀不限
fn has_reference(ref_dir: &Path, turtle_id: &str) -> Result<bool> {
    for entry in fs::read_dir(ref_dir)? {
        let path = entry?.path();
        if is_image(&path)
            && path.file_stem().is_some_and(|stem| stem == turtle_id)
            && sidecar::sidecar_path(&path).exists()
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// 从 `<源目录>/<州>/<地点>/<图片>` 结构批量导入参考图片
pub fn ingest_tree(extractor: &mut SiftExtractor, src: &Path, root: &Path) -> Result<IngestReport> {
    if !src.is_dir() {
        bail!("导入目录不存在: {}", src.display());
    }

    let mut report = IngestReport::default();
    for state in sorted_dirs(src)? {
        if state.file_name() == "System Volume Information" {
            continue;
        }
        for location in sorted_dirs(state.path())? {
            let location_dir = root.join(state.file_name()).join(location.file_name());
            for entry in WalkDir::new(location.path()).min_depth(1).max_depth(1).sort_by_file_name() {
                let entry = entry?;
                let path = entry.path();
                if !entry.file_type().is_file() || !is_image(path) {
                    continue;
                }
                let Some(turtle_id) = turtle_id_from_filename(&entry.file_name().to_string_lossy()) else {
                    report.record(IngestOutcome::Failed);
                    continue;
                };
                let outcome = ingest_reference(extractor, path, &location_dir, &turtle_id)
                    .unwrap_or_else(|e| {
                        warn!("导入失败 {}: {e}", path.display());
                        IngestOutcome::Failed
                    });
                report.record(outcome);
            }
        }
    }
    info!("导入完成，新增 {}，跳过 {}，失败 {}", report.created, report.skipped, report.failed);
    Ok(report)
}

/// 查找海龟所在的目录，优先使用 `州/地点` 形式的提示
pub fn find_turtle_dir(root: &Path, turtle_id: &str, location_hint: Option<&str>) -> Option<PathBuf> {
    if let Some(hint) = location_hint.filter(|h| !h.is_empty() && *h != UNKNOWN) {
        let path = root.join(hint).join(turtle_id);
        if path.is_dir() {
            return Some(path);
        }
    }
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .find(|e| e.file_type().is_dir() && e.depth() > 0 && e.file_name() == turtle_id)
        .map(|e| e.into_path())
}

/// 将一张观察图片复制到已存在海龟的 `loose_images` 目录，返回新文件路径
pub fn add_observation(
    root: &Path,
    image: &Path,
    turtle_id: &str,
    location_hint: Option<&str>,
) -> Result<PathBuf> {
    let turtle_dir = find_turtle_dir(root, turtle_id, location_hint)
        .ok_or_else(|| anyhow!("找不到海龟 {turtle_id} 的目录"))?;
    let loose_dir = turtle_dir.join(LOOSE_DIR);
    fs::create_dir_all(&loose_dir)?;

    let filename = image.file_name().ok_or_else(|| anyhow!("无效的图片路径: {}", image.display()))?;
    let ts = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    let dest = loose_dir.join(format!("Obs_{}_{}", ts, filename.to_string_lossy()));
    fs::copy(image, &dest)?;
    info!("观察图片已保存到 {}", dest.display());
    Ok(dest)
}
