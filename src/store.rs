//! 模型文件的持久化
//!
//! 每个领域的模型由四个文件组成，每个文件都带有同一个训练批次号。
//! 读取时批次号不一致或维度不匹配都视为模型损坏。

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail, ensure};
use log::{debug, info, warn};
use opencv::core::Mat;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::classifier::{Classifier, Evaluation, StandardScaler};
use crate::codebook::Codebook;
use crate::config::SiftOptions;
use crate::histogram;
use crate::sift::SiftExtractor;
use crate::utils;

const VOCABULARY: &str = "vocabulary.bin";
const SCALER: &str = "scaler.bin";
const CLASSIFIER: &str = "classifier.bin";
const LABELS: &str = "labels.bin";
const METRICS: &str = "metrics.json";
/// 发布顺序，`labels.bin` 是判断模型是否存在的依据
const FILES: [&str; 5] = [VOCABULARY, SCALER, CLASSIFIER, LABELS, METRICS];
/// 发布时旧模型文件的暂存位置，位于临时目录内
const PREVIOUS: &str = "previous";

/// 识别器接口：输入解码后的灰度图，输出标签与置信度
///
/// 任何能满足该接口的模型都可以替换词袋模型，而无需修改识别与主动学习流程。
pub trait Recognizer: Send + Sync {
    fn labels(&self) -> &[String];

    fn recognize(&self, image: &Mat) -> Result<Recognition>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub label: String,
    pub confidence: f64,
}

/// 从持久化存储中读取某个领域的模型
pub trait ArtifactLoader: Send + Sync {
    type Model: Recognizer;

    fn load(&self, domain: &str) -> Result<Self::Model>;
}

/// 词典文件的内容，特征提取参数与词典一起保存，保证识别时与训练时一致
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vocabulary {
    pub sift: SiftOptions,
    pub codebook: Codebook,
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    run_id: String,
    payload: T,
}

/// 一个领域的完整模型
#[derive(Debug, Clone)]
pub struct ModelBundle {
    pub run_id: String,
    pub vocabulary: Vocabulary,
    pub scaler: StandardScaler,
    pub classifier: Classifier,
    pub labels: Vec<String>,
}

impl ModelBundle {
    /// 检查四个部分之间的维度是否一致
    pub fn validate(&self) -> Result<()> {
        self.vocabulary.codebook.validate()?;
        let k = self.vocabulary.codebook.k();
        ensure!(self.scaler.dim() == k, "标准化器维度 {} 与词典大小 {k} 不一致", self.scaler.dim());
        ensure!(
            self.classifier.dim() == k,
            "分类器维度 {} 与词典大小 {k} 不一致",
            self.classifier.dim()
        );
        ensure!(
            self.classifier.n_classes() == self.labels.len(),
            "分类器类别数 {} 与标签数 {} 不一致",
            self.classifier.n_classes(),
            self.labels.len()
        );
        Ok(())
    }
}

impl Recognizer for ModelBundle {
    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn recognize(&self, image: &Mat) -> Result<Recognition> {
        let sift = &self.vocabulary.sift;
        let image = utils::adjust_image_size(image.try_clone()?, sift.max_side)?;
        let mut extractor = SiftExtractor::create(sift.clone())?;
        let (_, des) = extractor.detect(&image)?;
        debug!("提取到 {} 个描述符", des.len());

        let hist = histogram::bag_of_words(&des, &self.vocabulary.codebook);
        let hist = ndarray::Array1::from_iter(hist.into_iter().map(f64::from));
        let x = self.scaler.transform_row(hist.view());
        let pred = self.classifier.predict(x.view());
        Ok(Recognition { label: self.labels[pred.index].clone(), confidence: pred.confidence })
    }
}

/// 训练结果摘要，以 JSON 形式写在模型旁边供外部查看
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub domain: String,
    pub run_id: String,
    pub labels: Vec<String>,
    pub k: usize,
    pub samples_per_label: Vec<usize>,
    pub descriptors: usize,
    #[serde(flatten)]
    pub evaluation: Evaluation,
    /// 训练完成时间，UNIX 时间戳
    pub trained_at: u64,
}

/// 已写入临时目录、尚未生效的模型
#[derive(Debug)]
pub struct StagedBundle {
    domain: String,
    run_id: String,
    dir: PathBuf,
}

impl StagedBundle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

fn write_bincode<T: Serialize>(path: &Path, run_id: &str, payload: &T) -> Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    bincode::serialize_into(writer, &Envelope { run_id: run_id.to_string(), payload })
        .with_context(|| format!("写入模型文件失败: {}", path.display()))
}

/// 整个文件读入内存后再反序列化，长度前缀超出文件大小时返回错误而不是按其分配内存
fn read_bincode<T: DeserializeOwned>(path: &Path) -> Result<(String, T)> {
    let bytes = fs::read(path).with_context(|| format!("模型文件不存在: {}", path.display()))?;
    let envelope: Envelope<T> = bincode::deserialize(&bytes)
        .with_context(|| format!("模型文件已损坏: {}", path.display()))?;
    Ok((envelope.run_id, envelope.payload))
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn domain_dir(&self, domain: &str) -> PathBuf {
        self.root.join(domain)
    }

    /// 是否存在已发布的模型（不检查完整性）
    pub fn exists(&self, domain: &str) -> bool {
        self.domain_dir(domain).join(LABELS).is_file()
    }

    /// 已发布过模型的领域
    pub fn domains(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Ok(vec![]);
        }
        let mut domains = vec![];
        for entry in fs::read_dir(&self.root)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if self.exists(&name) {
                domains.push(name);
            }
        }
        domains.sort();
        Ok(domains)
    }

    /// 把模型写入领域目录下的临时目录，不影响正在使用的模型
    ///
    /// 写入失败时临时目录会被删除。
    pub fn stage(&self, bundle: &ModelBundle, metrics: &TrainingMetrics) -> Result<StagedBundle> {
        bundle.validate()?;
        let run_id = &bundle.run_id;
        let dir = self.domain_dir(&metrics.domain).join(format!(".staging-{run_id}"));
        let staged = StagedBundle { domain: metrics.domain.clone(), run_id: run_id.clone(), dir };

        let write = || -> Result<()> {
            fs::create_dir_all(&staged.dir)?;
            let dir = &staged.dir;
            write_bincode(&dir.join(VOCABULARY), run_id, &bundle.vocabulary)?;
            write_bincode(&dir.join(SCALER), run_id, &bundle.scaler)?;
            write_bincode(&dir.join(CLASSIFIER), run_id, &bundle.classifier)?;
            write_bincode(&dir.join(LABELS), run_id, &bundle.labels)?;
            serde_json::to_writer_pretty(BufWriter::new(File::create(dir.join(METRICS))?), metrics)?;
            Ok(())
        };
        if let Err(e) = write() {
            if staged.dir.exists() {
                let path = staged.dir.clone();
                if let Err(err) = self.discard(staged) {
                    warn!("删除临时目录 {} 失败: {err}", path.display());
                }
            }
            return Err(e.context("写入临时模型失败"));
        }

        debug!("模型已写入临时目录: {}", staged.dir.display());
        Ok(staged)
    }

    /// 把临时目录中的文件移动到正式位置
    ///
    /// 移动过程并非原子操作，调用者需要持有发布锁，读取方在同一把锁下加载模型。
    /// 旧文件先移入临时目录，任何一步失败都会还原旧模型。
    pub fn commit(&self, staged: StagedBundle) -> Result<()> {
        let target = self.domain_dir(&staged.domain);
        let previous = staged.dir.join(PREVIOUS);
        let mut journal = vec![];

        if let Err(e) = install(&staged.dir, &target, &previous, &mut journal) {
            match rollback(&target, &previous, &journal) {
                Ok(()) => {
                    if let Err(err) = fs::remove_dir_all(&staged.dir) {
                        warn!("删除临时目录 {} 失败: {err}", staged.dir.display());
                    }
                }
                // 旧文件仍在临时目录中，保留以便人工恢复
                Err(err) => warn!("还原领域 `{}` 的旧模型失败: {err:#}", staged.domain),
            }
            return Err(e.context(format!("发布领域 `{}` 的模型失败", staged.domain)));
        }

        fs::remove_dir_all(&staged.dir)?;
        info!("领域 `{}` 的模型已发布，批次号 {}", staged.domain, staged.run_id);
        Ok(())
    }

    /// 放弃一个未发布的模型
    pub fn discard(&self, staged: StagedBundle) -> Result<()> {
        fs::remove_dir_all(&staged.dir)?;
        Ok(())
    }

    pub fn read_metrics(&self, domain: &str) -> Result<Option<TrainingMetrics>> {
        let path = self.domain_dir(domain).join(METRICS);
        if !path.is_file() {
            return Ok(None);
        }
        let reader = BufReader::new(File::open(&path)?);
        Ok(Some(serde_json::from_reader(reader)?))
    }

    /// 写入领域目录下的任意 JSON 文件
    pub fn write_json<T: Serialize>(&self, domain: &str, name: &str, value: &T) -> Result<PathBuf> {
        let dir = self.domain_dir(domain);
        fs::create_dir_all(&dir)?;
        let path = dir.join(name);
        serde_json::to_writer_pretty(BufWriter::new(File::create(&path)?), value)?;
        Ok(path)
    }

    /// 读取并校验一个领域的完整模型
    pub fn load_bundle(&self, domain: &str) -> Result<ModelBundle> {
        let dir = self.domain_dir(domain);
        if !dir.join(LABELS).is_file() {
            bail!("领域 `{domain}` 尚未训练");
        }
        let (run_id, vocabulary) = read_bincode::<Vocabulary>(&dir.join(VOCABULARY))?;
        let (scaler_id, scaler) = read_bincode::<StandardScaler>(&dir.join(SCALER))?;
        let (classifier_id, classifier) = read_bincode::<Classifier>(&dir.join(CLASSIFIER))?;
        let (labels_id, labels) = read_bincode::<Vec<String>>(&dir.join(LABELS))?;

        ensure!(
            scaler_id == run_id && classifier_id == run_id && labels_id == run_id,
            "模型文件来自不同的训练批次"
        );

        let bundle = ModelBundle { run_id, vocabulary, scaler, classifier, labels };
        bundle.validate()?;
        Ok(bundle)
    }
}

/// 逐个替换模型文件，`journal` 记录已处理的文件以及它是否有旧版本
fn install(
    staging: &Path,
    target: &Path,
    previous: &Path,
    journal: &mut Vec<(&'static str, bool)>,
) -> Result<()> {
    fs::create_dir_all(previous)?;
    for name in FILES {
        let dst = target.join(name);
        let existed = dst.exists();
        if existed {
            fs::rename(&dst, previous.join(name))
                .with_context(|| format!("移走旧模型文件失败: {name}"))?;
        }
        journal.push((name, existed));
        fs::rename(staging.join(name), &dst).with_context(|| format!("发布模型文件失败: {name}"))?;
    }
    Ok(())
}

fn rollback(target: &Path, previous: &Path, journal: &[(&'static str, bool)]) -> Result<()> {
    for &(name, existed) in journal.iter().rev() {
        let dst = target.join(name);
        if dst.exists() {
            fs::remove_file(&dst)?;
        }
        if existed {
            fs::rename(previous.join(name), &dst)?;
        }
    }
    Ok(())
}

impl ArtifactLoader for ArtifactStore {
    type Model = ModelBundle;

    fn load(&self, domain: &str) -> Result<ModelBundle> {
        self.load_bundle(domain)
    }
}

/// 生成训练批次号：时间戳加随机后缀
pub fn new_run_id() -> String {
    use rand::distr::{Alphanumeric, SampleString};

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{now}-{}", Alphanumeric.sample_string(&mut rand::rng(), 6))
}
