use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use prometheus::*;

static METRIC_SEARCH_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!("plastron_search_count", "count of the image to search", &["pass"]).unwrap()
});

static METRIC_SEARCH_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!("plastron_search_duration", "duration of the per-image search in seconds").unwrap()
});

static METRIC_SEARCH_TOP_SCORE: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "plastron_search_top_score",
        "inlier count of the best candidate",
        (0..=100).step_by(5).map(|x| x as f64).collect()
    )
    .unwrap()
});

static METRIC_REBUILD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "plastron_rebuild_duration",
        "duration of the index rebuild in seconds",
        vec![1., 10., 60., 300., 900., 1800., 3600.]
    )
    .unwrap()
});

/// 记录一次搜索，`mirrored` 表示最终结果来自镜像方向
pub fn observe_search(duration: f32, top_score: usize, mirrored: bool) {
    let pass = if mirrored { "mirrored" } else { "normal" };
    METRIC_SEARCH_COUNT.with_label_values(&[pass]).inc();
    METRIC_SEARCH_DURATION.observe(duration as f64);
    METRIC_SEARCH_TOP_SCORE.observe(top_score as f64);
}

pub fn observe_rebuild_duration(duration: f32) {
    METRIC_REBUILD_DURATION.observe(duration as f64);
}

/// 推送所有指标到 push gateway，`auth` 格式为 username:password
///
/// 阻塞调用，在异步环境中需要放到 spawn_blocking 中执行
pub fn push(url: &str, instance: &str, auth: Option<&str>) -> Result<()> {
    let auth = match auth {
        Some(s) => {
            let (username, password) = s.split_once(':').ok_or_else(|| anyhow!("认证信息格式错误"))?;
            Some(BasicAuthentication { username: username.to_string(), password: password.to_string() })
        }
        None => None,
    };
    push_metrics(
        "plastron",
        labels! {
            "instance".to_string() => instance.to_string(),
        },
        url,
        gather(),
        auth,
    )?;
    Ok(())
}
