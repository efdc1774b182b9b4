// 运维 HTTP 接口
// 所有响应 HTTP 200，业务结果放在 {code, data} 中

use crate::error::GatewayError;
use crate::stream::{PlayRequest, StreamRegistry};
use axum::{
    extract::{Path, State},
    routing::{get, post},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub const CODE_SUCCESS: i32 = 0;
pub const CODE_SYSTEM_ERROR: i32 = 1000;
pub const CODE_PARAMS_ERROR: i32 = 1001;

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub code: i32,
    pub data: Value,
}

impl ApiResponse {
    pub fn ok(data: impl Serialize) -> Json<Self> {
        match serde_json::to_value(data) {
            Ok(data) => Json(Self {
                code: CODE_SUCCESS,
                data,
            }),
            Err(e) => {
                tracing::error!(target: "gb28181d", error = %e, "failed to serialize response data");
                Json(Self {
                    code: CODE_SYSTEM_ERROR,
                    data: Value::String(e.to_string()),
                })
            }
        }
    }

    pub fn error(err: &GatewayError) -> Json<Self> {
        let code = match err {
            GatewayError::InvalidParams(_) | GatewayError::StreamNotFound(_) => CODE_PARAMS_ERROR,
            _ => CODE_SYSTEM_ERROR,
        };
        Json(Self {
            code,
            data: Value::String(err.to_string()),
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub streams: Arc<StreamRegistry>,
}

/// 点播表单：replay=1 为回放，start/end 为 unix 秒
#[derive(Debug, Default, Deserialize)]
pub struct PlayForm {
    pub replay: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
}

impl PlayForm {
    /// 转换为点播请求；回放时间无法解析按 0 处理，由注册表拒绝
    pub fn into_request(self, channel_id: String) -> PlayRequest {
        if self.replay.as_deref().map(str::trim) != Some("1") {
            return PlayRequest::live(channel_id);
        }
        let parse = |v: Option<String>| {
            v.and_then(|s| s.trim().parse::<i64>().ok())
                .unwrap_or_default()
        };
        PlayRequest::replay(channel_id, parse(self.start), parse(self.end))
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/channels/:id/streams", post(play))
        .route("/streams", get(list_streams))
        .route("/streams/:id", get(get_stream).delete(stop))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn play(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    form: Option<Form<PlayForm>>,
) -> Json<ApiResponse> {
    // 无表单体（或非表单编码）按全部缺省处理，即直播
    let form = form.map(|Form(form)| form).unwrap_or_default();
    let req = form.into_request(channel_id);
    match state.streams.play(req).await {
        Ok(stream) => ApiResponse::ok(stream),
        Err(e) => {
            tracing::warn!(target: "gb28181d", error = %e, "play failed");
            ApiResponse::error(&e)
        }
    }
}

async fn stop(State(state): State<AppState>, Path(stream_id): Path<String>) -> Json<ApiResponse> {
    match state.streams.stop(&stream_id).await {
        Ok(()) => {
            tracing::info!(target: "gb28181d", %stream_id, "stream stopped by api");
            ApiResponse::ok("")
        }
        Err(e) => ApiResponse::error(&e),
    }
}

async fn list_streams(State(state): State<AppState>) -> Json<ApiResponse> {
    ApiResponse::ok(state.streams.list())
}

/// 查询单个会话，视为一次访问
async fn get_stream(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> Json<ApiResponse> {
    if !state.streams.touch(&stream_id) {
        return ApiResponse::error(&GatewayError::StreamNotFound(stream_id));
    }
    match state.streams.get(&stream_id) {
        Some(stream) => ApiResponse::ok(stream),
        None => ApiResponse::error(&GatewayError::StreamNotFound(stream_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamKind;

    #[test]
    fn test_play_form_defaults_to_live() {
        let req = PlayForm::default().into_request("ch1".to_string());
        assert_eq!(req.kind, StreamKind::Live);

        let form = PlayForm {
            replay: Some("0".to_string()),
            start: Some("100".to_string()),
            end: Some("200".to_string()),
        };
        assert_eq!(form.into_request("ch1".to_string()).kind, StreamKind::Live);
    }

    #[test]
    fn test_play_form_replay_parsing() {
        let form = PlayForm {
            replay: Some("1".to_string()),
            start: Some("100".to_string()),
            end: Some("abc".to_string()),
        };
        let req = form.into_request("ch1".to_string());
        assert_eq!(req.kind, StreamKind::Replay);
        assert_eq!(req.start, Some(100));
        assert_eq!(req.end, Some(0));
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> std::result::Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("broken"))
        }
    }

    #[test]
    fn test_ok_reports_serialization_failure() {
        let resp = ApiResponse::ok(Unserializable);
        assert_eq!(resp.0.code, CODE_SYSTEM_ERROR);
        assert_eq!(ApiResponse::ok("x").0.code, CODE_SUCCESS);
    }

    #[test]
    fn test_error_codes() {
        let e = GatewayError::InvalidParams("start".to_string());
        assert_eq!(ApiResponse::error(&e).0.code, CODE_PARAMS_ERROR);

        let e = GatewayError::StreamNotFound("x".to_string());
        assert_eq!(ApiResponse::error(&e).0.code, CODE_PARAMS_ERROR);

        let e = GatewayError::Relay("down".to_string());
        assert_eq!(ApiResponse::error(&e).0.code, CODE_SYSTEM_ERROR);
    }
}
