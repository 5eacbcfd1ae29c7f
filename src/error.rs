use thiserror::Error;

/// 单次识别可能出现的错误
#[derive(Debug, Error)]
pub enum ClassifyError {
    /// 图片无法解码，不应重试
    #[error("无法解码图片: {0}")]
    Decode(String),

    /// 领域模型不存在或已损坏，训练完成后可重试
    #[error("领域 `{domain}` 的模型不可用: {reason}")]
    Unavailable { domain: String, reason: String },

    /// 特征提取或分类过程中出现的其他错误
    #[error("识别失败: {0}")]
    Pipeline(#[source] anyhow::Error),
}

impl ClassifyError {
    pub fn unavailable(domain: &str, reason: impl ToString) -> Self {
        Self::Unavailable { domain: domain.to_string(), reason: reason.to_string() }
    }

    /// 用于指标标签
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::Unavailable { .. } => "unavailable",
            Self::Pipeline(_) => "pipeline",
        }
    }
}

/// 反馈样本无法入库时的错误
#[derive(Debug, Error)]
pub enum FeedbackError {
    #[error("无法解码图片: {0}")]
    Decode(String),

    #[error("非法的名称: {0:?}")]
    InvalidName(String),

    #[error("保存样本失败: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// 导致本轮训练无法产出模型的错误，旧模型保持不变
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("领域 `{0}` 中没有任何样本")]
    NoImages(String),

    #[error("领域 `{0}` 的所有样本都没有提取到特征点")]
    NoDescriptors(String),

    #[error("至少需要两个有样本的标签，当前只有 {0} 个")]
    TooFewLabels(usize),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
