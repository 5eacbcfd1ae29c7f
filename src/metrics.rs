use std::sync::LazyLock;

use prometheus::*;

static METRIC_PREDICTION_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "logoscope_prediction_count",
        "count of classification requests",
        &["domain", "outcome"]
    )
    .unwrap()
});

static METRIC_PREDICTION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "logoscope_prediction_duration",
        "duration of the per-image classification in seconds",
        &["domain"]
    )
    .unwrap()
});

static METRIC_PREDICTION_CONFIDENCE: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "logoscope_prediction_confidence",
        "confidence of the top label",
        &["domain"],
        (1..=20).map(|x| x as f64 * 0.05).collect()
    )
    .unwrap()
});

static METRIC_TRAINING_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "logoscope_training_count",
        "count of training runs",
        &["domain", "outcome"]
    )
    .unwrap()
});

static METRIC_TRAINING_ACCURACY: LazyLock<GaugeVec> = LazyLock::new(|| {
    register_gauge_vec!(
        "logoscope_training_accuracy",
        "held-out accuracy of the last published model",
        &["domain"]
    )
    .unwrap()
});

static METRIC_EXPANSION_SAMPLES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "logoscope_expansion_samples",
        "count of samples fetched by dataset expansion",
        &["domain", "result"]
    )
    .unwrap()
});

/// 记录一次识别请求，`outcome` 为 `ok` 或错误类型
pub fn inc_prediction(domain: &str, outcome: &str) {
    METRIC_PREDICTION_COUNT.with_label_values(&[domain, outcome]).inc();
}

pub fn observe_prediction(domain: &str, duration: f64, confidence: f64) {
    METRIC_PREDICTION_DURATION.with_label_values(&[domain]).observe(duration);
    METRIC_PREDICTION_CONFIDENCE.with_label_values(&[domain]).observe(confidence);
}

pub fn inc_training(domain: &str, outcome: &str) {
    METRIC_TRAINING_COUNT.with_label_values(&[domain, outcome]).inc();
}

pub fn set_training_accuracy(domain: &str, accuracy: f64) {
    METRIC_TRAINING_ACCURACY.with_label_values(&[domain]).set(accuracy);
}

/// `result` 为 `accepted`、`duplicate`、`invalid` 或 `error`
pub fn inc_expansion_samples(domain: &str, result: &str, n: u64) {
    METRIC_EXPANSION_SAMPLES.with_label_values(&[domain, result]).inc_by(n);
}

/// 以文本格式导出所有指标
pub fn gather_text() -> Result<String> {
    let encoder = TextEncoder::new();
    encoder.encode_to_string(&prometheus::gather())
}
