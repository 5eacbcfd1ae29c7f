//! 单飞训练调度
//!
//! 整个进程共用一个忙碌标记，不区分领域。训练进行中时新的提交会被拒绝，
//! 被拒绝的领域记录下来，由后续的提交或定时巡检补上。

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{error, info, warn};
use serde::Serialize;
use tokio::task::{JoinError, JoinHandle};

use crate::error::TrainingError;
use crate::metrics;

/// 一次训练的结果摘要
#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub domain: String,
    pub run_id: String,
    pub labels: Vec<String>,
    pub k: usize,
    pub images: usize,
    pub accuracy: Option<f64>,
    pub calibrated: bool,
    pub duration: Duration,
}

/// 训练任务本身，`Trainer` 只负责调度
pub trait TrainingTask: Send + Sync + 'static {
    fn run(&self, domain: &str) -> Result<TrainingReport, TrainingError>;
}

/// 正在后台执行的训练
#[derive(Debug)]
pub struct TrainingHandle {
    domain: String,
    handle: JoinHandle<Result<TrainingReport, TrainingError>>,
}

impl TrainingHandle {
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// 等待训练结束
    pub async fn wait(self) -> Result<TrainingReport, TrainingError> {
        self.handle.await.map_err(|e: JoinError| TrainingError::Other(e.into()))?
    }
}

#[derive(Debug)]
pub enum SubmitOutcome {
    Started(TrainingHandle),
    /// 已有训练在进行，本次提交被推迟
    Busy,
}

impl SubmitOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started(_))
    }
}

/// 训练结束时无论成功与否都会清除忙碌标记
struct BusyGuard(Arc<Mutex<bool>>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = false;
    }
}

pub struct Trainer<T: TrainingTask> {
    task: Arc<T>,
    busy: Arc<Mutex<bool>>,
    deferred: Arc<Mutex<BTreeSet<String>>>,
}

impl<T: TrainingTask> Clone for Trainer<T> {
    fn clone(&self) -> Self {
        Self { task: self.task.clone(), busy: self.busy.clone(), deferred: self.deferred.clone() }
    }
}

impl<T: TrainingTask> Trainer<T> {
    pub fn new(task: T) -> Self {
        Self {
            task: Arc::new(task),
            busy: Arc::new(Mutex::new(false)),
            deferred: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    pub fn task(&self) -> &T {
        &self.task
    }

    fn deferred(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.deferred.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_busy(&self) -> bool {
        *self.busy.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 被推迟、等待重新训练的领域
    pub fn pending(&self) -> Vec<String> {
        self.deferred().iter().cloned().collect()
    }

    /// 尝试占用忙碌标记
    fn acquire(&self) -> Option<BusyGuard> {
        let mut busy = self.busy.lock().unwrap_or_else(|e| e.into_inner());
        if *busy {
            return None;
        }
        *busy = true;
        Some(BusyGuard(self.busy.clone()))
    }

    /// 提交一个领域的训练，立即返回
    ///
    /// 必须在 tokio 运行时中调用，训练本身在阻塞线程池中执行。
    pub fn submit(&self, domain: &str) -> SubmitOutcome {
        let Some(guard) = self.acquire() else {
            warn!("已有训练任务在进行，领域 `{domain}` 的训练被推迟");
            self.deferred().insert(domain.to_string());
            return SubmitOutcome::Busy;
        };
        self.deferred().remove(domain);

        info!("开始训练领域 `{domain}`");
        let task = self.task.clone();
        let name = domain.to_string();
        let handle = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let result = task.run(&name);
            match &result {
                Ok(report) => {
                    metrics::inc_training(&name, "ok");
                    if let Some(acc) = report.accuracy {
                        metrics::set_training_accuracy(&name, acc);
                    }
                    info!("领域 `{name}` 训练完成，耗时 {:.1?}", report.duration);
                }
                Err(e) => {
                    metrics::inc_training(&name, "error");
                    error!("领域 `{name}` 训练失败，保留旧模型: {e}");
                }
            }
            result
        });
        SubmitOutcome::Started(TrainingHandle { domain: domain.to_string(), handle })
    }

    /// 重新提交一个被推迟的领域，空闲时才会生效
    pub fn sweep(&self) -> Option<TrainingHandle> {
        if self.is_busy() {
            return None;
        }
        let domain = self.deferred().first().cloned()?;
        match self.submit(&domain) {
            SubmitOutcome::Started(handle) => Some(handle),
            SubmitOutcome::Busy => None,
        }
    }
}
