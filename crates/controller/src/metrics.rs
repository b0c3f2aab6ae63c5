/// Prometheus 指标

use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use once_cell::sync::Lazy;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec, TextEncoder};
use tracing::error;

/// 主机不可达或超时导致的切换次数
pub static DISPATCH_FAILOVERS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "storage_dispatch_failovers_total",
        "Number of times a pool command failed over to another host"
    )
    .expect("指标注册失败")
});

/// 存储池状态变更，按目标状态统计
pub static POOL_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "storage_pool_transitions_total",
        "Storage pool status transitions",
        &["to"]
    )
    .expect("指标注册失败")
});

/// 维护工作项处理次数，按动作统计
pub static WORK_ITEMS_PROCESSED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "storage_pool_work_items_total",
        "Maintenance work items processed",
        &["action"]
    )
    .expect("指标注册失败")
});

/// GET /metrics
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&prometheus::gather()) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("导出指标失败: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
