use axum::body::Bytes;
use axum_typed_multipart::TryFromMultipart;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

/// 指定领域的查询参数
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DomainQuery {
    /// 领域名称，例如 `cars`
    pub domain: String,
}

/// 识别请求
#[derive(TryFromMultipart)]
pub struct PredictRequest {
    pub file: Bytes,
}

/// 识别表单（用于API文档）
#[derive(Debug, ToSchema)]
#[allow(unused)]
pub struct PredictForm {
    /// 上传的图片文件
    #[schema(format = Binary, content_media_type = "application/octet-stream")]
    pub file: String,
}

/// 识别响应
#[derive(Debug, Serialize, ToSchema)]
pub struct PredictResponse {
    /// 识别出的标签，置信度不足时为 `Unknown`
    pub label: String,
    pub confidence: f64,
    /// 置信度是否达到阈值
    pub recognized: bool,
}

/// 反馈请求
#[derive(Debug, Deserialize, ToSchema)]
pub struct FeedbackRequest {
    /// Base64 编码的图片
    pub image_base64: String,
    /// 识别结果或用户声明的标签
    pub label: String,
    /// 识别结果是否正确
    #[serde(default)]
    pub is_correct: bool,
    /// 识别错误时的正确名称，可以是新的品牌
    #[serde(default)]
    pub new_brand_name: Option<String>,
}

/// 反馈响应
#[derive(Debug, Serialize, ToSchema)]
pub struct FeedbackResponse {
    /// `accepted: retraining` 或 `accepted: expanding_and_retraining`
    pub status: String,
    /// 规范化后的标签
    pub label: String,
    /// 该标签现有的样本数量
    pub samples: usize,
}

/// 手动训练响应
#[derive(Debug, Serialize, ToSchema)]
pub struct TrainResponse {
    /// `accepted: retraining` 或 `busy`
    pub status: String,
}

/// 领域信息
#[derive(Debug, Serialize, ToSchema)]
pub struct DomainInfo {
    pub domain: String,
    /// 是否有已发布的模型
    pub trained: bool,
    /// 模型中的标签
    pub labels: Vec<String>,
    /// 最近一次训练的留出集准确率
    pub accuracy: Option<f64>,
    /// 是否正驻留在内存中
    pub active: bool,
}
