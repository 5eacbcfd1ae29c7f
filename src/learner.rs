//! 主动学习：根据一条反馈决定直接重训还是先扩充数据集再重训
//!
//! 对单条反馈，保存样本、统计数量、扩充、提交训练严格按顺序执行。
//! 样本保存是同步的，之后的步骤在后台进行，不阻塞反馈的响应。

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, spawn_blocking};
use tokio::time::{Instant, timeout_at};

use crate::config::LearnOptions;
use crate::corpus::Corpus;
use crate::error::FeedbackError;
use crate::metrics;
use crate::provider::{Sample, SampleProvider};
use crate::trainer::{SubmitOutcome, Trainer, TrainingTask};
use crate::utils;

/// 一条用户反馈
#[derive(Debug, Clone)]
pub struct Feedback {
    pub domain: String,
    pub image: Vec<u8>,
    /// 识别结果或用户声明的标签
    pub label: String,
    /// 识别结果是否正确
    pub is_correct: bool,
    /// 识别错误时用户给出的正确名称，可以是全新的标签
    pub new_name: Option<String>,
}

impl Feedback {
    /// 样本最终归入的标签，尚未规范化
    pub fn claimed_label(&self) -> &str {
        if self.is_correct {
            return &self.label;
        }
        self.new_name.as_deref().filter(|name| !name.trim().is_empty()).unwrap_or(&self.label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// 样本充足，直接重训
    Refine,
    /// 样本不足，先扩充数据集
    Starve,
}

impl Decision {
    pub fn status(self) -> &'static str {
        match self {
            Self::Refine => "accepted: retraining",
            Self::Starve => "accepted: expanding_and_retraining",
        }
    }
}

/// 反馈被接受后的立即回执
#[derive(Debug, Clone, Serialize)]
pub struct Ack {
    pub domain: String,
    pub label: String,
    pub decision: Decision,
    /// 保存后该标签的样本数量
    pub samples: usize,
    pub saved: PathBuf,
}

impl Ack {
    pub fn status(&self) -> &'static str {
        self.decision.status()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExpansionReport {
    pub query: String,
    pub accepted: usize,
    pub duplicates: usize,
    pub invalid: usize,
    pub errors: usize,
    /// 是否因为超出时间预算而提前结束
    pub timed_out: bool,
}

/// 后台步骤的结果
#[derive(Debug)]
pub struct FollowUp {
    pub expansion: Option<ExpansionReport>,
    pub submission: SubmitOutcome,
}

struct Inner<T: TrainingTask, P: SampleProvider> {
    corpus: Corpus,
    trainer: Trainer<T>,
    provider: P,
    opts: LearnOptions,
}

pub struct Learner<T: TrainingTask, P: SampleProvider> {
    inner: Arc<Inner<T, P>>,
}

impl<T: TrainingTask, P: SampleProvider> Clone for Learner<T, P> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

/// 只接受能解码的 JPEG 与 PNG
fn is_valid_image(bytes: &[u8]) -> bool {
    utils::image_extension(bytes).is_some() && matches!(utils::imdecode(bytes, 0), Ok(Some(_)))
}

enum Candidate {
    Accepted,
    Duplicate,
    Invalid,
}

/// 校验并保存一张候选图片，包含解码与写盘，需要在阻塞线程中调用
fn admit(
    corpus: &Corpus,
    domain: &str,
    label: &str,
    bytes: &[u8],
    known: &Mutex<HashSet<blake3::Hash>>,
) -> Result<Candidate, FeedbackError> {
    if !is_valid_image(bytes) {
        return Ok(Candidate::Invalid);
    }
    let mut known = known.blocking_lock();
    Ok(match corpus.add_unique(domain, label, bytes, &mut known)? {
        Some(_) => Candidate::Accepted,
        None => Candidate::Duplicate,
    })
}

impl<T: TrainingTask, P: SampleProvider> Learner<T, P> {
    pub fn new(corpus: Corpus, trainer: Trainer<T>, provider: P, opts: LearnOptions) -> Self {
        Self { inner: Arc::new(Inner { corpus, trainer, provider, opts }) }
    }

    pub fn provider(&self) -> &P {
        &self.inner.provider
    }

    /// 接收一条反馈
    ///
    /// 样本写入样本库后立即返回回执，扩充与重训在后台执行，返回的句柄可用于等待其结束。
    /// 必须在 tokio 运行时中调用。
    pub fn receive(&self, feedback: Feedback) -> Result<(Ack, JoinHandle<FollowUp>), FeedbackError> {
        let domain = utils::normalize_name(&feedback.domain)
            .ok_or_else(|| FeedbackError::InvalidName(feedback.domain.clone()))?;
        let claimed = feedback.claimed_label();
        let label = utils::normalize_name(claimed)
            .ok_or_else(|| FeedbackError::InvalidName(claimed.to_string()))?;
        if !is_valid_image(&feedback.image) {
            return Err(FeedbackError::Decode("仅支持可解码的 JPEG 与 PNG 图片".to_string()));
        }

        let corpus = &self.inner.corpus;
        let saved = corpus.save_sample(&domain, &label, &feedback.image)?;
        let samples = corpus.count_samples(&domain, &label)?;
        let decision = if samples < self.inner.opts.starvation_floor {
            Decision::Starve
        } else {
            Decision::Refine
        };
        info!("收到反馈：{domain}/{label}，现有 {samples} 个样本，决策 {decision:?}");

        let learner = self.clone();
        let follow_up = {
            let (domain, label) = (domain.clone(), label.clone());
            tokio::spawn(async move {
                let expansion = match decision {
                    Decision::Starve => Some(learner.expand(&domain, &label).await),
                    Decision::Refine => None,
                };
                // 无论扩充得到多少新样本都要重训，用户提交的样本本身就是新信息
                let submission = learner.inner.trainer.submit(&domain);
                FollowUp { expansion, submission }
            })
        };

        Ok((Ack { domain, label, decision, samples, saved }, follow_up))
    }

    /// 通过样本来源为某个标签扩充样本
    ///
    /// 达到批量上限或超出时间预算时停止，单个候选失败只会被跳过。
    pub async fn expand(&self, domain: &str, label: &str) -> ExpansionReport {
        let opts = &self.inner.opts;
        let corpus = &self.inner.corpus;
        let query = format!("{} logo {}", label.replace('_', " "), domain.replace('_', " "));
        let mut report = ExpansionReport { query: query.clone(), ..Default::default() };
        info!("扩充样本：{query}，目标 {} 张", opts.expand_batch);

        let known = {
            let (corpus, domain, label) = (corpus.clone(), domain.to_string(), label.to_string());
            spawn_blocking(move || corpus.content_hashes(&domain, &label)).await
        };
        let known = match known {
            Ok(Ok(known)) => known,
            Ok(Err(e)) => {
                warn!("读取已有样本失败，跳过去重: {e:#}");
                HashSet::new()
            }
            Err(e) => {
                warn!("读取已有样本的任务异常退出，跳过去重: {e}");
                HashSet::new()
            }
        };
        let known = Arc::new(Mutex::new(known));

        let deadline = Instant::now() + opts.expand_budget();
        let mut samples = self.inner.provider.fetch(&query, opts.expand_batch);
        while report.accepted < opts.expand_batch {
            let Sample { url, bytes } = match timeout_at(deadline, samples.next()).await {
                Err(_) => {
                    warn!("扩充超出时间预算，已获取 {} 张", report.accepted);
                    report.timed_out = true;
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!("获取候选图片失败: {e:#}");
                    report.errors += 1;
                    continue;
                }
                Ok(Some(Ok(sample))) => sample,
            };

            let task = {
                let (corpus, known) = (corpus.clone(), known.clone());
                let (domain, label) = (domain.to_string(), label.to_string());
                spawn_blocking(move || admit(&corpus, &domain, &label, &bytes, &known))
            };
            match task.await {
                Ok(Ok(Candidate::Accepted)) => report.accepted += 1,
                Ok(Ok(Candidate::Duplicate)) => report.duplicates += 1,
                Ok(Ok(Candidate::Invalid)) => {
                    debug!("候选图片格式无效: {url}");
                    report.invalid += 1;
                }
                Ok(Err(e)) => {
                    warn!("保存候选图片失败: {e}");
                    report.errors += 1;
                }
                Err(e) => {
                    warn!("处理候选图片的任务异常退出: {e}");
                    report.errors += 1;
                }
            }
        }

        info!(
            "扩充结束：新增 {}，重复 {}，无效 {}，失败 {}",
            report.accepted, report.duplicates, report.invalid, report.errors
        );
        metrics::inc_expansion_samples(domain, "accepted", report.accepted as u64);
        metrics::inc_expansion_samples(domain, "duplicate", report.duplicates as u64);
        metrics::inc_expansion_samples(domain, "invalid", report.invalid as u64);
        metrics::inc_expansion_samples(domain, "error", report.errors as u64);
        report
    }
}
