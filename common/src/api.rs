use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Códigos de error del plano de control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    BadRequest,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

/// Sobre común de todas las respuestas (executor y coordinador).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub successful: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl ApiResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            successful: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            successful: false,
            data: None,
            error: Some(ApiError {
                code,
                message: message.into(),
            }),
        }
    }

    /// El coordinador confirma un reporte con `successful` y sin `data: false`.
    pub fn is_ack(&self) -> bool {
        self.successful && self.data != Some(Value::Bool(false))
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ack_requiere_successful_y_data_distinta_de_false() {
        assert!(ApiResponse::ok(json!(true)).is_ack());
        assert!(ApiResponse::ok(json!({"id": 1})).is_ack());
        assert!(!ApiResponse::ok(json!(false)).is_ack());
        assert!(!ApiResponse::error(ErrorCode::Internal, "x").is_ack());
    }

    #[test]
    fn error_se_serializa_con_codigo() {
        let resp = ApiResponse::error(ErrorCode::NotFound, "no existe");
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["successful"], json!(false));
        assert_eq!(v["error"]["code"], json!("NOT_FOUND"));
        assert!(v.get("data").is_none());
    }
}
