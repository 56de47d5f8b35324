use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::{ApiError, Result};

/// Optional fields an upstream error body may carry.
#[derive(Debug, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: Option<JsonValue>,
    #[serde(default)]
    pub error: Option<JsonValue>,
    #[serde(default)]
    pub code: Option<JsonValue>,
    #[serde(default)]
    pub error_code: Option<JsonValue>,
}

impl ErrorBody {
    fn parse(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_default()
    }

    fn message(&self) -> Option<String> {
        text_field(self.message.as_ref()).or_else(|| text_field(self.error.as_ref()))
    }

    fn code(&self) -> Option<String> {
        text_field(self.code.as_ref()).or_else(|| text_field(self.error_code.as_ref()))
    }
}

/// Converts a non-success response into [`ApiError::Http`].
pub fn http_error(status: StatusCode, body: String) -> ApiError {
    let parsed = ErrorBody::parse(&body);
    let message = parsed.message().unwrap_or_else(|| status_line(status));
    ApiError::Http {
        status: status.as_u16(),
        code: parsed.code(),
        message,
        body,
    }
}

/// Decodes a success body: JSON when the content type says so, raw text otherwise.
pub fn decode_success(content_type: Option<&str>, body: String) -> Result<JsonValue> {
    let is_json = content_type.is_some_and(|value| value.to_ascii_lowercase().contains("json"));
    if !is_json {
        return Ok(JsonValue::String(body));
    }
    if body.trim().is_empty() {
        return Ok(JsonValue::Null);
    }
    serde_json::from_str(&body).map_err(|err| {
        ApiError::Decode(format!("invalid JSON response: {err}; body: {body}"))
    })
}

fn status_line(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("HTTP {} {reason}", status.as_u16()),
        None => format!("HTTP {}", status.as_u16()),
    }
}

fn text_field(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::Null => None,
        JsonValue::String(text) if text.is_empty() => None,
        JsonValue::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use serde_json::json;

    use super::{decode_success, http_error};
    use crate::ApiError;

    fn fields(err: ApiError) -> (u16, Option<String>, String, String) {
        match err {
            ApiError::Http {
                status,
                code,
                message,
                body,
            } => (status, code, message, body),
            other => panic!("expected http error, got {other:?}"),
        }
    }

    #[test]
    fn prefers_message_and_code_fields() {
        let body = json!({
            "message": "Email không hợp lệ",
            "error": "ignored",
            "code": "INVALID_EMAIL",
            "error_code": "ignored"
        })
        .to_string();
        let (status, code, message, raw) =
            fields(http_error(StatusCode::UNPROCESSABLE_ENTITY, body.clone()));

        assert_eq!(status, 422);
        assert_eq!(code.as_deref(), Some("INVALID_EMAIL"));
        assert_eq!(message, "Email không hợp lệ");
        assert_eq!(raw, body);
    }

    #[test]
    fn falls_back_to_error_and_error_code_fields() {
        let body = json!({"error": "Location not found", "error_code": 4041}).to_string();
        let (_, code, message, _) = fields(http_error(StatusCode::NOT_FOUND, body));

        assert_eq!(message, "Location not found");
        assert_eq!(code.as_deref(), Some("4041"));
    }

    #[test]
    fn object_messages_are_rendered_as_json_text() {
        let body = json!({"message": {"email": ["required"]}}).to_string();
        let (_, _, message, _) = fields(http_error(StatusCode::BAD_REQUEST, body));
        assert_eq!(message, r#"{"email":["required"]}"#);
    }

    #[test]
    fn non_json_body_uses_status_line() {
        let (status, code, message, raw) = fields(http_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "<html>upstream down</html>".to_owned(),
        ));
        assert_eq!(status, 503);
        assert_eq!(code, None);
        assert_eq!(message, "HTTP 503 Service Unavailable");
        assert_eq!(raw, "<html>upstream down</html>");
    }

    #[test]
    fn success_body_decodes_by_content_type() {
        assert_eq!(
            decode_success(Some("application/json; charset=utf-8"), r#"{"total":3}"#.to_owned())
                .expect("json body must decode"),
            json!({"total": 3})
        );
        assert_eq!(
            decode_success(Some("text/csv"), "id,name\n1,HQ".to_owned()).expect("text body"),
            json!("id,name\n1,HQ")
        );
        assert_eq!(
            decode_success(Some("application/json"), String::new()).expect("empty body"),
            json!(null)
        );
        assert!(matches!(
            decode_success(Some("application/json"), "{oops".to_owned()),
            Err(ApiError::Decode(_))
        ));
    }
}
