use std::sync::Arc;

use anyhow::Result;

use crate::cache::ModelCache;
use crate::config::{DataDir, LearnOptions, SiftOptions, TrainOptions};
use crate::corpus::Corpus;
use crate::learner::Learner;
use crate::pipeline::{Publisher, TrainingPipeline};
use crate::predictor::{Predictor, PublishGate};
use crate::provider::{HttpSampleProvider, SampleProvider};
use crate::store::ArtifactStore;
use crate::trainer::Trainer;

/// 把各个组件组装在一起，进程内只应创建一个
///
/// 模型缓存与发布锁都在这里创建，再分发给识别与训练两条路径。
pub struct Engine<P: SampleProvider = HttpSampleProvider> {
    pub data: DataDir,
    pub corpus: Corpus,
    pub store: ArtifactStore,
    pub predictor: Predictor<ArtifactStore>,
    pub trainer: Trainer<TrainingPipeline>,
    pub learner: Learner<TrainingPipeline, P>,
}

impl Engine<HttpSampleProvider> {
    /// `progress` 控制训练时是否显示进度条
    pub fn open(
        data: DataDir,
        sift: SiftOptions,
        train: TrainOptions,
        learn: LearnOptions,
        progress: bool,
    ) -> Result<Self> {
        let provider = HttpSampleProvider::new(&learn.search_endpoint, learn.fetch_timeout())?;
        Ok(Self::with_provider(data, sift, train, learn, provider, progress))
    }
}

impl<P: SampleProvider> Engine<P> {
    pub fn with_provider(
        data: DataDir,
        sift: SiftOptions,
        train: TrainOptions,
        learn: LearnOptions,
        provider: P,
        progress: bool,
    ) -> Self {
        let corpus = Corpus::new(data.corpus());
        let store = ArtifactStore::new(data.models());
        let cache = Arc::new(ModelCache::new(store.clone()));
        let gate = Arc::new(PublishGate::new());

        let predictor = Predictor::new(cache.clone(), gate.clone());
        let publisher = Publisher::new(store.clone(), cache, gate);
        let pipeline =
            TrainingPipeline::new(corpus.clone(), data.domains_file(), publisher, sift, train)
                .with_progress(progress);
        let trainer = Trainer::new(pipeline);
        let learner = Learner::new(corpus.clone(), trainer.clone(), provider, learn);

        Self { data, corpus, store, predictor, trainer, learner }
    }
}
