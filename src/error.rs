use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::http_client::HttpClientError;
use crate::registry::RegistryError;
use crate::session::SessionError;
use crate::store::StoreError;
use crate::transfer::TransferError;

/// 引擎错误分类
#[derive(Debug, Error)]
pub enum EngineError {
    /// 网络错误或超时
    #[error("资源站无法访问: {0}")]
    SourceUnreachable(String),

    /// 异常状态码或数据结构不符
    #[error("资源站响应异常: {0}")]
    SourceMalformedResponse(String),

    /// HTML / LLM JSON 解析失败
    #[error("资源提取失败: {0}")]
    ExtractionFailure(String),

    #[error("其他资源站未找到同名作品")]
    NoEquivalentFound,

    #[error("不支持的播放格式: {0}")]
    StreamUnsupported(String),

    #[error("代理地址未初始化")]
    RelayNotConfigured,

    #[error("无法获取视频详情")]
    WorkNotFound,

    #[error("没有可播放的剧集")]
    NoEpisodes,
}

impl From<HttpClientError> for EngineError {
    fn from(e: HttpClientError) -> Self {
        match e {
            HttpClientError::RelayNotConfigured => EngineError::RelayNotConfigured,
            HttpClientError::BadStatus(code) => {
                EngineError::SourceMalformedResponse(format!("HTTP {}", code))
            }
            HttpClientError::Timeout => EngineError::SourceUnreachable("请求超时".to_string()),
            HttpClientError::RequestFailed(msg) => EngineError::SourceUnreachable(msg),
        }
    }
}

/// HTTP 接口错误
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("全部资源站请求失败")]
    AllSourcesFailed,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Engine(e) => engine_status(e),
            ApiError::Registry(e) => match e {
                RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
                RegistryError::Duplicate(_) | RegistryError::BuiltIn(_) => StatusCode::CONFLICT,
                RegistryError::Invalid(_) => StatusCode::BAD_REQUEST,
                RegistryError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Store(e) => {
                tracing::error!("存储错误: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Session(e) => match e {
                SessionError::Engine(e) => engine_status(e),
                SessionError::NotOpen | SessionError::Superseded => StatusCode::CONFLICT,
                SessionError::EpisodeNotFound(_) => StatusCode::NOT_FOUND,
            },
            ApiError::Transfer(e) => match e {
                TransferError::MissingRelay | TransferError::InvalidFormat(_) => {
                    StatusCode::BAD_REQUEST
                }
                TransferError::Fetch(_) => StatusCode::BAD_GATEWAY,
                TransferError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::AllSourcesFailed => StatusCode::BAD_GATEWAY,
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

fn engine_status(e: &EngineError) -> StatusCode {
    match e {
        EngineError::RelayNotConfigured => StatusCode::PRECONDITION_FAILED,
        EngineError::WorkNotFound | EngineError::NoEquivalentFound => StatusCode::NOT_FOUND,
        EngineError::NoEpisodes | EngineError::StreamUnsupported(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        EngineError::SourceUnreachable(_)
        | EngineError::SourceMalformedResponse(_)
        | EngineError::ExtractionFailure(_) => StatusCode::BAD_GATEWAY,
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_errors_map_to_taxonomy() {
        assert!(matches!(
            EngineError::from(HttpClientError::Timeout),
            EngineError::SourceUnreachable(_)
        ));
        assert!(matches!(
            EngineError::from(HttpClientError::BadStatus(500)),
            EngineError::SourceMalformedResponse(_)
        ));
        assert!(matches!(
            EngineError::from(HttpClientError::RelayNotConfigured),
            EngineError::RelayNotConfigured
        ));
    }

    #[test]
    fn test_status_codes() {
        let resp = ApiError::from(EngineError::RelayNotConfigured).into_response();
        assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);
        let resp = ApiError::AllSourcesFailed.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let resp = ApiError::from(RegistryError::BuiltIn("a".into())).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
