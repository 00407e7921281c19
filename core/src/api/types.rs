//! Request/response DTOs and the admission error envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Sequence, SequenceState};

const MISSING_REQUIRED_PARAMETER: u16 = 10200;
const INVALID_PARAMETER_VALUE: u16 = 10201;
const INTERNAL_SERVER_ERROR: u16 = 10500;

/// One entry of the admission error envelope.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ApiError {
	pub code: u16,
	pub message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub details: Option<Value>,
}

impl ApiError {
	pub fn missing_required_parameter(parameter: &str) -> Self {
		ApiError {
			code: MISSING_REQUIRED_PARAMETER,
			message: format!("Missing required parameter: {parameter}."),
			details: Some(serde_json::json!({ "parameter": parameter })),
		}
	}

	pub fn invalid_parameter_value(parameter: &str, reason: &str, details: Option<Value>) -> Self {
		ApiError {
			code: INVALID_PARAMETER_VALUE,
			message: reason.to_string(),
			details: Some(match details {
				Some(Value::Object(mut map)) => {
					map.insert("parameter".to_string(), Value::from(parameter));
					Value::Object(map)
				},
				_ => serde_json::json!({ "parameter": parameter }),
			}),
		}
	}

	pub fn internal_server_error() -> Self {
		ApiError {
			code: INTERNAL_SERVER_ERROR,
			message: "Internal Server Error".to_string(),
			details: None,
		}
	}
}

#[derive(Serialize, Debug)]
pub struct ErrorEnvelope {
	pub errors: Vec<ApiError>,
}

impl From<ApiError> for ErrorEnvelope {
	fn from(error: ApiError) -> Self {
		ErrorEnvelope {
			errors: vec![error],
		}
	}
}

#[derive(Deserialize, Debug)]
pub struct CreateSequenceRequest {
	pub transactions: Vec<Value>,
}

#[derive(Serialize, Debug)]
pub struct CreateSequenceResponse {
	pub id: i64,
}

/// Wire representation of a sequence; timestamps are unix milliseconds.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SequenceResponse {
	pub id: i64,
	pub broadcasted_count: u32,
	pub total_count: u32,
	pub state: SequenceState,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error_message: Option<String>,
	pub created_at: i64,
	pub updated_at: i64,
}

impl From<Sequence> for SequenceResponse {
	fn from(sequence: Sequence) -> Self {
		SequenceResponse {
			id: sequence.id,
			broadcasted_count: sequence.broadcasted_count,
			total_count: sequence.total_count,
			state: sequence.state,
			error_message: sequence.error_message,
			created_at: sequence.created_at.timestamp_millis(),
			updated_at: sequence.updated_at.timestamp_millis(),
		}
	}
}
