use std::collections::BTreeMap;
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::cli::*;
use crate::utils::normalize_name;

static DATA_DIR: LazyLock<String> = LazyLock::new(|| {
    ProjectDirs::from("", "logoscope", "logoscope")
        .map(|dirs| dirs.data_dir().to_string_lossy().into_owned())
        .unwrap_or_else(|| "data".to_string())
});

fn default_data_dir() -> &'static str {
    DATA_DIR.as_str()
}

#[derive(Parser, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiftOptions {
    /// 图片最长边的上限，超过时等比缩小
    #[arg(long, value_name = "PIXELS", default_value_t = 640)]
    pub max_side: i32,
    /// 每张图片保留的最大特征点数量，0 表示不限制
    #[arg(long, value_name = "N", default_value_t = 0)]
    pub max_keypoints: i32,
}

impl Default for SiftOptions {
    fn default() -> Self {
        Self { max_side: 640, max_keypoints: 0 }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct TrainOptions {
    /// 视觉词典大小（聚类中心数量）
    #[arg(short, long, value_name = "K", default_value_t = 500)]
    pub k: usize,
    /// KMeans 最大迭代次数
    #[arg(long, value_name = "N", default_value_t = 50)]
    pub max_iter: usize,
    /// 训练词典时最多使用的描述符数量，超出时随机采样
    #[arg(long, value_name = "N", default_value_t = 200_000)]
    pub vocab_sample: usize,
    /// 线性 SVM 的惩罚系数
    #[arg(short = 'C', long, default_value_t = 1.0)]
    pub svm_c: f64,
    /// 随机种子，用于数据划分和采样
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self { k: 500, max_iter: 50, vocab_sample: 200_000, svm_c: 1.0, seed: 42 }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct LearnOptions {
    /// 样本数量低于该值的标签视为“饥饿”，需要先扩充数据集
    #[arg(long, value_name = "N", default_value_t = 5)]
    pub starvation_floor: usize,
    /// 每次扩充尝试获取的新样本数量
    #[arg(long, value_name = "N", default_value_t = 40)]
    pub expand_batch: usize,
    /// 单个下载请求的超时时间，单位为秒
    #[arg(long, value_name = "SECS", default_value_t = 5)]
    pub fetch_timeout: u64,
    /// 一次扩充的总耗时上限，单位为秒
    #[arg(long, value_name = "SECS", default_value_t = 120)]
    pub expand_budget: u64,
    /// 图片搜索接口，返回 `{"results": [{"image": url}]}`
    #[arg(long, value_name = "URL", default_value = "http://127.0.0.1:8090/images")]
    pub search_endpoint: String,
}

impl LearnOptions {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout)
    }

    pub fn expand_budget(&self) -> Duration {
        Duration::from_secs(self.expand_budget)
    }
}

impl Default for LearnOptions {
    fn default() -> Self {
        Self {
            starvation_floor: 5,
            expand_batch: 40,
            fetch_timeout: 5,
            expand_budget: 120,
            search_endpoint: "http://127.0.0.1:8090/images".to_string(),
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "logoscope", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// 数据目录，包含样本库与模型文件
    #[arg(short, long, default_value = default_data_dir())]
    pub data_dir: DataDir,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 启动 HTTP 识别服务
    Server(ServerCommand),
    /// 重新训练某个领域的模型
    Train(TrainCommand),
    /// 识别一张图片
    Predict(PredictCommand),
    /// 提交一条反馈样本，并等待后台训练完成
    Feedback(FeedbackCommand),
    /// 搜索最佳的词典大小
    Tune(TuneCommand),
    /// 绘制图片的 SIFT 特征点
    Show(ShowCommand),
}

#[derive(Debug, Clone)]
pub struct DataDir {
    path: PathBuf,
}

impl DataDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 返回原始样本库的根目录
    pub fn corpus(&self) -> PathBuf {
        self.path.join("corpus")
    }

    /// 返回模型文件的根目录
    pub fn models(&self) -> PathBuf {
        self.path.join("models")
    }

    /// 返回领域配置文件的路径
    pub fn domains_file(&self) -> PathBuf {
        self.path.join("domains.toml")
    }
}

impl FromStr for DataDir {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DomainEntry {
    #[serde(default)]
    labels: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DomainsFile {
    #[serde(default)]
    domains: BTreeMap<String, DomainEntry>,
}

/// 各领域预设的标签列表
///
/// 训练时实际使用的标签集合为预设标签与样本库中已存在目录的并集。
#[derive(Debug, Clone, Default)]
pub struct DomainRegistry {
    seeds: BTreeMap<String, Vec<String>>,
}

impl DomainRegistry {
    /// 读取 `domains.toml`，文件不存在时返回空配置
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("领域配置文件不存在: {}", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("读取领域配置失败: {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("解析领域配置失败: {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let file: DomainsFile = toml::from_str(text)?;
        let seeds = file
            .domains
            .into_iter()
            .filter_map(|(domain, entry)| {
                let labels = entry.labels.iter().filter_map(|s| normalize_name(s)).collect();
                Some((normalize_name(&domain)?, labels))
            })
            .collect();
        Ok(Self { seeds })
    }

    pub fn seed_labels(&self, domain: &str) -> &[String] {
        self.seeds.get(domain).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.seeds.keys().map(String::as_str)
    }
}
