use actix_web::{error::JsonPayloadError, HttpResponse};
use serde::Serialize;

/// Error body shared by every endpoint. `error` is the human-readable reason.
#[derive(Serialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
    pub fields: serde_json::Value,
}

fn bad_request(error: String, fields: serde_json::Map<String, serde_json::Value>) -> actix_web::Error {
    let error_response = ErrorResponse {
        error,
        fields: serde_json::Value::Object(fields),
    };
    actix_web::error::InternalError::from_response("", HttpResponse::BadRequest().json(error_response))
        .into()
}

fn describe_json_error(message: &str) -> &'static str {
    if message.contains("EOF while parsing") {
        "Request body is empty. Expected JSON payload"
    } else if message.contains("unknown variant") {
        "Invalid enum value. Check allowed values for this field"
    } else if message.contains("invalid type") {
        "A field has the wrong type"
    } else {
        "Invalid JSON format"
    }
}

/// JSON extractor config with the project's error body, capped at `limit` bytes
pub fn json_config(limit: usize) -> actix_web_validator::JsonConfig {
    actix_web_validator::JsonConfig::default()
        .limit(limit)
        .error_handler(|err, _req| {
            let mut fields = serde_json::Map::new();

            match err {
                actix_web_validator::Error::Validate(validation_errors) => {
                    let mut first = None;
                    for (field, errors) in validation_errors.field_errors() {
                        let messages: Vec<String> = errors
                            .iter()
                            .map(|e| {
                                e.message
                                    .as_ref()
                                    .map(|m| m.to_string())
                                    .unwrap_or_else(|| format!("Validation error in field: {}", field))
                            })
                            .collect();
                        if first.is_none() {
                            first = messages.first().cloned();
                        }
                        fields.insert(field.to_string(), serde_json::json!({"errors": messages}));
                    }

                    bad_request(first.unwrap_or_else(|| "Validation failed".to_string()), fields)
                }
                actix_web_validator::Error::JsonPayloadError(JsonPayloadError::Overflow { limit })
                | actix_web_validator::Error::JsonPayloadError(JsonPayloadError::OverflowKnownLength {
                    limit,
                    ..
                }) => {
                    let error_response = ErrorResponse {
                        error: "Request body is too large".to_string(),
                        fields: serde_json::json!({"limit": limit}),
                    };
                    actix_web::error::InternalError::from_response(
                        "",
                        HttpResponse::PayloadTooLarge().json(error_response),
                    )
                    .into()
                }
                actix_web_validator::Error::JsonPayloadError(JsonPayloadError::ContentType) => {
                    fields.insert(
                        "message".to_string(),
                        serde_json::json!("Content-Type must be application/json"),
                    );
                    bad_request("Request validation failed".to_string(), fields)
                }
                actix_web_validator::Error::JsonPayloadError(payload_err) => {
                    let message = describe_json_error(&payload_err.to_string());
                    fields.insert("message".to_string(), serde_json::json!(message));
                    bad_request("Request validation failed".to_string(), fields)
                }
                actix_web_validator::Error::Deserialize(de_err) => {
                    let message = describe_json_error(&de_err.to_string());
                    fields.insert("message".to_string(), serde_json::json!(message));
                    bad_request("Request validation failed".to_string(), fields)
                }
                _ => {
                    fields.insert("message".to_string(), serde_json::json!("Validation error"));
                    bad_request("Validation failed".to_string(), fields)
                }
            }
        })
}
