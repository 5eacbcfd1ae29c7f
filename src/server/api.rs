use std::collections::BTreeSet;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum_typed_multipart::TypedMultipart;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use log::{debug, info, warn};
use serde_json::{Value, json};
use tokio::task::block_in_place;

use super::error::{AppError, Result};
use super::state::AppState;
use super::types::*;
use crate::config::DomainRegistry;
use crate::learner::Feedback;
use crate::predictor::Verdict;
use crate::trainer::SubmitOutcome;
use crate::{metrics, utils};

fn domain_name(query: &DomainQuery) -> Result<String> {
    utils::normalize_name(&query.domain)
        .ok_or_else(|| AppError::BadRequest(format!("非法的领域名称: {:?}", query.domain)))
}

/// 识别一张图片
#[utoipa::path(
    post,
    path = "/predict",
    params(DomainQuery),
    request_body(content = PredictForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, body = PredictResponse),
        (status = 400, description = "图片无法解码"),
        (status = 503, description = "该领域的模型尚不可用"),
    )
)]
pub async fn predict_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DomainQuery>,
    data: TypedMultipart<PredictRequest>,
) -> Result<Json<PredictResponse>> {
    let domain = domain_name(&query)?;
    debug!("识别请求：领域 `{domain}`，{} 字节", data.file.len());

    let recognition = block_in_place(|| state.engine.predictor.classify(&data.file, &domain))?;
    let verdict = Verdict::new(recognition, state.threshold);

    Ok(Json(PredictResponse {
        label: verdict.label,
        confidence: verdict.confidence,
        recognized: verdict.recognized,
    }))
}

/// 提交反馈样本，立即返回，扩充与重训在后台进行
#[utoipa::path(
    post,
    path = "/feedback",
    params(DomainQuery),
    request_body = FeedbackRequest,
    responses(
        (status = 202, body = FeedbackResponse),
        (status = 400, description = "图片或名称不合法"),
    )
)]
pub async fn feedback_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DomainQuery>,
    Json(data): Json<FeedbackRequest>,
) -> Result<(StatusCode, Json<FeedbackResponse>)> {
    // 兼容 `data:image/png;base64,` 形式的前缀
    let encoded = data.image_base64.rsplit(',').next().unwrap_or_default();
    let image = STANDARD
        .decode(encoded.trim())
        .map_err(|e| AppError::BadRequest(format!("无法解析 base64 图片: {e}")))?;

    let feedback = Feedback {
        domain: query.domain,
        image,
        label: data.label,
        is_correct: data.is_correct,
        new_name: data.new_brand_name,
    };
    let (ack, _follow_up) = block_in_place(|| state.engine.learner.receive(feedback))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(FeedbackResponse {
            status: ack.status().to_string(),
            label: ack.label,
            samples: ack.samples,
        }),
    ))
}

/// 手动触发某个领域的重新训练
#[utoipa::path(
    post,
    path = "/train",
    params(DomainQuery),
    responses(
        (status = 202, body = TrainResponse),
    )
)]
pub async fn train_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DomainQuery>,
) -> Result<(StatusCode, Json<TrainResponse>)> {
    let domain = domain_name(&query)?;
    let status = match state.engine.trainer.submit(&domain) {
        SubmitOutcome::Started(_) => "accepted: retraining",
        SubmitOutcome::Busy => "busy",
    };
    info!("手动训练领域 `{domain}`: {status}");
    Ok((StatusCode::ACCEPTED, Json(TrainResponse { status: status.to_string() })))
}

/// 列出所有已知领域
#[utoipa::path(
    get,
    path = "/domains",
    responses(
        (status = 200, body = Vec<DomainInfo>),
    )
)]
pub async fn domains_handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<DomainInfo>>> {
    let engine = &state.engine;
    let registry = DomainRegistry::load(engine.data.domains_file())?;

    let mut domains = registry.domains().map(str::to_string).collect::<BTreeSet<_>>();
    domains.extend(engine.corpus.domains()?);
    domains.extend(engine.store.domains()?);

    let active = engine.predictor.cache().active_domain();
    let infos = domains
        .into_iter()
        .map(|domain| {
            let metrics = engine.store.read_metrics(&domain).unwrap_or_else(|e| {
                warn!("读取领域 `{domain}` 的训练指标失败: {e:#}");
                None
            });
            DomainInfo {
                trained: engine.store.exists(&domain),
                labels: metrics.as_ref().map(|m| m.labels.clone()).unwrap_or_default(),
                accuracy: metrics.and_then(|m| m.evaluation.accuracy),
                active: active.as_deref() == Some(domain.as_str()),
                domain,
            }
        })
        .collect();
    Ok(Json(infos))
}

/// 服务状态
#[utoipa::path(get, path = "/health")]
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let trainer = &state.engine.trainer;
    Json(json!({
        "status": "ok",
        "training": trainer.is_busy(),
        "pending": trainer.pending(),
    }))
}

/// Prometheus 指标
#[utoipa::path(get, path = "/metrics")]
pub async fn metrics_handler() -> Result<impl IntoResponse> {
    let body = metrics::gather_text().map_err(anyhow::Error::from)?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}
