//! 训练流程：从样本库重新生成词典、标准化器与分类器，评估后发布

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use indicatif::{ParallelProgressIterator, ProgressBar};
use log::{info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;

use crate::cache::ModelCache;
use crate::classifier::{self, FitParams};
use crate::codebook::Codebook;
use crate::config::{DomainRegistry, SiftOptions, TrainOptions};
use crate::corpus::Corpus;
use crate::error::TrainingError;
use crate::histogram;
use crate::predictor::PublishGate;
use crate::sift::{Descriptor, SiftExtractor};
use crate::store::{ArtifactStore, ModelBundle, TrainingMetrics, Vocabulary, new_run_id};
use crate::trainer::{TrainingReport, TrainingTask};
use crate::utils::pb_style;

/// 一张训练图片的特征
pub struct ImageFeatures {
    pub label: usize,
    pub descriptors: Vec<Descriptor>,
}

/// 从样本库中提取出的训练数据
pub struct Dataset {
    pub domain: String,
    pub labels: Vec<String>,
    pub images: Vec<ImageFeatures>,
}

impl Dataset {
    pub fn samples_per_label(&self) -> Vec<usize> {
        classifier::class_counts(
            &self.images.iter().map(|img| img.label).collect::<Vec<_>>(),
            self.labels.len(),
        )
    }

    pub fn descriptor_count(&self) -> usize {
        self.images.iter().map(|img| img.descriptors.len()).sum()
    }
}

/// 读取样本库并提取所有图片的描述符
///
/// 无法解码的图片会被跳过，没有任何可用图片的标签不会进入模型。
pub fn load_dataset(
    corpus: &Corpus,
    domain: &str,
    seeds: &[String],
    sift: &SiftOptions,
    progress: bool,
) -> Result<Dataset, TrainingError> {
    let candidates = corpus.labels(domain, seeds)?;
    let mut files = vec![];
    for label in &candidates {
        let images = corpus.images(domain, label)?;
        if images.is_empty() {
            warn!("标签 `{label}` 没有任何样本，本轮训练忽略该标签");
        }
        files.extend(images.into_iter().map(|path| (label.as_str(), path)));
    }
    if files.is_empty() {
        return Err(TrainingError::NoImages(domain.to_string()));
    }
    info!("领域 `{domain}` 共 {} 个候选标签，{} 张图片", candidates.len(), files.len());

    let pb = if progress { ProgressBar::new(files.len() as u64) } else { ProgressBar::hidden() };
    pb.set_style(pb_style());
    pb.set_message("提取特征点");

    let extracted = files
        .par_iter()
        .progress_with(pb.clone())
        .map_init(
            || SiftExtractor::create(sift.clone()),
            |extractor, (label, path)| -> anyhow::Result<Option<(&str, Vec<Descriptor>)>> {
                let extractor = extractor.as_mut().map_err(|e| anyhow!("创建 SIFT 失败: {e}"))?;
                match extractor.detect_file(path)? {
                    Some(des) => Ok(Some((*label, des))),
                    None => {
                        warn!("无法解码图片，已跳过: {}", path.display());
                        Ok(None)
                    }
                }
            },
        )
        .collect::<anyhow::Result<Vec<_>>>()?;
    pb.finish_with_message("特征点提取完成");

    let extracted = extracted.into_iter().flatten().collect::<Vec<_>>();
    let mut labels = extracted.iter().map(|(label, _)| label.to_string()).collect::<Vec<_>>();
    labels.dedup();
    if labels.len() < 2 {
        return Err(TrainingError::TooFewLabels(labels.len()));
    }

    let mut images = Vec::with_capacity(extracted.len());
    for (label, descriptors) in extracted {
        // labels 与 extracted 同序，二分查找即可
        let label = labels.binary_search_by(|l| l.as_str().cmp(label)).map_err(|_| {
            TrainingError::Other(anyhow!("标签 `{label}` 不在标签列表中"))
        })?;
        images.push(ImageFeatures { label, descriptors });
    }

    let dataset = Dataset { domain: domain.to_string(), labels, images };
    if dataset.descriptor_count() == 0 {
        return Err(TrainingError::NoDescriptors(domain.to_string()));
    }
    Ok(dataset)
}

/// 训练出的模型及其指标，尚未写入磁盘
pub struct FittedModel {
    pub bundle: ModelBundle,
    pub metrics: TrainingMetrics,
}

/// 在数据集上训练完整的模型
pub fn fit_model(
    dataset: &Dataset,
    sift: &SiftOptions,
    opts: &TrainOptions,
) -> Result<FittedModel, TrainingError> {
    let mut pool = dataset.images.iter().flat_map(|img| img.descriptors.iter().copied()).collect::<Vec<_>>();
    if pool.is_empty() {
        return Err(TrainingError::NoDescriptors(dataset.domain.clone()));
    }
    if pool.len() > opts.vocab_sample {
        info!("从 {} 个描述符中随机采样 {} 个用于训练词典", pool.len(), opts.vocab_sample);
        let mut rng = StdRng::seed_from_u64(opts.seed);
        let picked = rand::seq::index::sample(&mut rng, pool.len(), opts.vocab_sample);
        pool = picked.into_iter().map(|i| pool[i]).collect();
    }

    let codebook = Codebook::train(&pool, opts.k, opts.max_iter)?;
    drop(pool);

    let histograms = dataset
        .images
        .par_iter()
        .map(|img| histogram::bag_of_words(&img.descriptors, &codebook))
        .collect::<Vec<_>>();
    let x = classifier::to_matrix(&histograms, codebook.k());
    let y = dataset.images.iter().map(|img| img.label).collect::<Vec<_>>();

    let model = classifier::train(
        &x,
        &y,
        dataset.labels.len(),
        FitParams { c: opts.svm_c, seed: opts.seed },
    )?;

    let run_id = new_run_id();
    let metrics = TrainingMetrics {
        domain: dataset.domain.clone(),
        run_id: run_id.clone(),
        labels: dataset.labels.clone(),
        k: codebook.k(),
        samples_per_label: dataset.samples_per_label(),
        descriptors: dataset.descriptor_count(),
        evaluation: model.evaluation,
        trained_at: SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs(),
    };
    let bundle = ModelBundle {
        run_id,
        vocabulary: Vocabulary { sift: sift.clone(), codebook },
        scaler: model.scaler,
        classifier: model.classifier,
        labels: dataset.labels.clone(),
    };
    Ok(FittedModel { bundle, metrics })
}

/// 把模型写入存储并在发布锁下生效，随后使缓存失效
pub struct Publisher {
    store: ArtifactStore,
    cache: Arc<ModelCache<ArtifactStore>>,
    gate: Arc<PublishGate>,
}

impl Publisher {
    pub fn new(
        store: ArtifactStore,
        cache: Arc<ModelCache<ArtifactStore>>,
        gate: Arc<PublishGate>,
    ) -> Self {
        Self { store, cache, gate }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn publish(&self, model: &FittedModel) -> anyhow::Result<()> {
        let domain = &model.metrics.domain;
        // 写文件在锁外完成，锁内只做重命名
        let staged = self.store.stage(&model.bundle, &model.metrics)?;
        let _gate = self.gate.lock();
        self.store.commit(staged)?;
        self.cache.invalidate(domain);
        Ok(())
    }
}

/// 完整的训练任务
pub struct TrainingPipeline {
    corpus: Corpus,
    domains_file: PathBuf,
    publisher: Publisher,
    sift: SiftOptions,
    opts: TrainOptions,
    progress: bool,
}

impl TrainingPipeline {
    pub fn new(
        corpus: Corpus,
        domains_file: PathBuf,
        publisher: Publisher,
        sift: SiftOptions,
        opts: TrainOptions,
    ) -> Self {
        Self { corpus, domains_file, publisher, sift, opts, progress: false }
    }

    /// 是否显示进度条
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// 按当前配置文件与样本库重新读取数据集
    pub fn dataset(&self, domain: &str) -> Result<Dataset, TrainingError> {
        let registry = DomainRegistry::load(&self.domains_file)?;
        load_dataset(&self.corpus, domain, registry.seed_labels(domain), &self.sift, self.progress)
    }
}

impl TrainingTask for TrainingPipeline {
    fn run(&self, domain: &str) -> Result<TrainingReport, TrainingError> {
        let start = Instant::now();
        let dataset = self.dataset(domain)?;
        let model = fit_model(&dataset, &self.sift, &self.opts)?;
        self.publisher.publish(&model)?;

        Ok(TrainingReport {
            domain: domain.to_string(),
            run_id: model.bundle.run_id.clone(),
            labels: model.bundle.labels.clone(),
            k: model.metrics.k,
            images: dataset.images.len(),
            accuracy: model.metrics.evaluation.accuracy,
            calibrated: model.metrics.evaluation.calibrated,
            duration: start.elapsed(),
        })
    }
}
