use std::sync::LazyLock;

use prometheus::*;

static METRIC_SEARCH_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!("imatch_search_count", "count of searches", &["mode"]).unwrap()
});

static METRIC_SEARCH_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "imatch_search_duration",
        "duration of the per-query search in seconds",
        &["mode"]
    )
    .unwrap()
});

static METRIC_SEARCH_MAX_SCORE: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "imatch_search_max_score",
        "max hybrid score of the per-query search",
        &["mode"],
        (1..=20).map(|x| x as f64 * 0.05).collect()
    )
    .unwrap()
});

static METRIC_EARLY_STOP_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!("imatch_early_stop_count", "count of early stopped searches", &["mode"])
        .unwrap()
});

static METRIC_REFINE_FAILURE_COUNT: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("imatch_refine_failure_count", "count of skipped corrupt candidates")
        .unwrap()
});

static METRIC_INDEXED_DESCRIPTORS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("imatch_indexed_descriptors", "descriptors in the last built index").unwrap()
});

/// 记录一次搜索
pub fn observe_search(mode: &str, duration: f32, max_score: Option<f32>, early_stopped: bool) {
    METRIC_SEARCH_COUNT.with_label_values(&[mode]).inc();
    METRIC_SEARCH_DURATION.with_label_values(&[mode]).observe(duration as f64);
    if let Some(score) = max_score {
        METRIC_SEARCH_MAX_SCORE.with_label_values(&[mode]).observe(score as f64);
    }
    if early_stopped {
        METRIC_EARLY_STOP_COUNT.with_label_values(&[mode]).inc();
    }
}

pub fn inc_refine_failure() {
    METRIC_REFINE_FAILURE_COUNT.inc();
}

pub fn set_indexed_descriptors(n: usize) {
    METRIC_INDEXED_DESCRIPTORS.set(n as i64);
}

/// 以文本格式导出所有指标
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    encoder.encode_to_string(&prometheus::gather()).unwrap_or_default()
}
