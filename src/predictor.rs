use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use log::debug;
use serde::Serialize;

use crate::cache::ModelCache;
use crate::error::ClassifyError;
use crate::metrics;
use crate::store::{ArtifactLoader, Recognition, Recognizer};
use crate::utils;

/// 低于阈值时对外展示的标签
pub const UNKNOWN_LABEL: &str = "Unknown";

/// 识别与模型发布共用的互斥区
///
/// 识别在加载模型到计算完成之间持有该锁，发布在移动模型文件到缓存失效之间持有该锁，
/// 因此识别永远不会看到来自两个训练批次的模型文件。
#[derive(Debug, Default)]
pub struct PublishGate(Mutex<()>);

impl PublishGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 应用置信度阈值后的识别结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub label: String,
    pub confidence: f64,
    pub recognized: bool,
}

impl Verdict {
    /// 置信度低于 `threshold` 时标签替换为 [`UNKNOWN_LABEL`]
    pub fn new(recognition: Recognition, threshold: f64) -> Self {
        let recognized = recognition.confidence >= threshold;
        let label = if recognized { recognition.label } else { UNKNOWN_LABEL.to_string() };
        Self { label, confidence: recognition.confidence, recognized }
    }
}

pub struct Predictor<L: ArtifactLoader> {
    cache: Arc<ModelCache<L>>,
    gate: Arc<PublishGate>,
}

impl<L: ArtifactLoader> Clone for Predictor<L> {
    fn clone(&self) -> Self {
        Self { cache: self.cache.clone(), gate: self.gate.clone() }
    }
}

impl<L: ArtifactLoader> Predictor<L> {
    pub fn new(cache: Arc<ModelCache<L>>, gate: Arc<PublishGate>) -> Self {
        Self { cache, gate }
    }

    pub fn cache(&self) -> &ModelCache<L> {
        &self.cache
    }

    /// 识别一张图片，返回原始标签与置信度，阈值由调用者处理
    pub fn classify(&self, bytes: &[u8], domain: &str) -> Result<Recognition, ClassifyError> {
        let start = Instant::now();
        let result = self.classify_inner(bytes, domain);
        match &result {
            Ok(r) => {
                metrics::inc_prediction(domain, "ok");
                metrics::observe_prediction(domain, start.elapsed().as_secs_f64(), r.confidence);
                debug!("识别结果: {} ({:.3})，耗时 {:?}", r.label, r.confidence, start.elapsed());
            }
            Err(e) => metrics::inc_prediction(domain, e.kind()),
        }
        result
    }

    fn classify_inner(&self, bytes: &[u8], domain: &str) -> Result<Recognition, ClassifyError> {
        // 解码失败时直接返回，不触碰缓存
        let image = utils::imdecode(bytes, 0)
            .map_err(|e| ClassifyError::Decode(e.to_string()))?
            .ok_or_else(|| ClassifyError::Decode("无法识别的图片数据".to_string()))?;

        let _gate = self.gate.lock();
        let model = self.cache.load(domain)?;
        model.recognize(&image).map_err(ClassifyError::Pipeline)
    }
}
