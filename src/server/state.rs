use std::sync::Arc;

use crate::engine::Engine;
use crate::provider::{HttpSampleProvider, SampleProvider};

/// 应用状态
pub struct AppState<P: SampleProvider = HttpSampleProvider> {
    pub engine: Engine<P>,
    /// 置信度阈值，低于该值时返回 `Unknown`
    pub threshold: f64,
}

impl<P: SampleProvider> AppState<P> {
    /// 创建新的应用状态
    pub fn new(engine: Engine<P>, threshold: f64) -> Arc<Self> {
        Arc::new(AppState { engine, threshold })
    }
}
