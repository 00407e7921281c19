use std::{collections::HashMap, convert::Infallible, sync::Arc};
use tokio::sync::mpsc;
use tracing::{debug, error};
use warp::{
	http::StatusCode,
	reply::{self, Json, WithStatus},
};

use super::types::{
	ApiError, CreateSequenceRequest, CreateSequenceResponse, ErrorEnvelope, SequenceResponse,
};
use crate::{node, store::Store};

pub(super) fn error_reply(status: StatusCode, error: ApiError) -> WithStatus<Json> {
	reply::with_status(reply::json(&ErrorEnvelope::from(error)), status)
}

pub async fn get_sequence<S: Store>(
	sequence_id: i64,
	store: Arc<S>,
) -> Result<WithStatus<Json>, Infallible> {
	match store.get_sequence_by_id(sequence_id).await {
		Ok(Some(sequence)) => Ok(reply::with_status(
			reply::json(&SequenceResponse::from(sequence)),
			StatusCode::OK,
		)),
		Ok(None) => Ok(reply::with_status(
			reply::json(&serde_json::json!({ "message": "Sequence not found" })),
			StatusCode::NOT_FOUND,
		)),
		Err(store_error) => {
			error!(sequence_id, "Cannot get sequence from the store: {store_error:#}");
			Ok(error_reply(
				StatusCode::INTERNAL_SERVER_ERROR,
				ApiError::internal_server_error(),
			))
		},
	}
}

pub async fn create_sequence<S: Store, N: node::Client>(
	request: CreateSequenceRequest,
	store: Arc<S>,
	node_client: Arc<N>,
	nudge: mpsc::Sender<i64>,
) -> Result<WithStatus<Json>, Infallible> {
	if request.transactions.is_empty() {
		return Ok(error_reply(
			StatusCode::BAD_REQUEST,
			ApiError::invalid_parameter_value(
				"transactions",
				"There are no transactions in the request.",
				None,
			),
		));
	}

	let mut txs = Vec::with_capacity(request.transactions.len());
	let mut seen: HashMap<String, usize> = HashMap::new();
	for (index, transaction) in request.transactions.iter().enumerate() {
		if !transaction.is_object() {
			return Ok(error_reply(
				StatusCode::BAD_REQUEST,
				ApiError::invalid_parameter_value(
					"transactions",
					"Each transaction must be a JSON object.",
					Some(serde_json::json!({ "position": index })),
				),
			));
		}

		let raw = transaction.to_string();
		if let Some(first_index) = seen.insert(raw.clone(), index) {
			return Ok(error_reply(
				StatusCode::BAD_REQUEST,
				ApiError::invalid_parameter_value(
					"transactions",
					"There are duplicates in the transactions array.",
					Some(serde_json::json!({ "duplicates": [first_index, index] })),
				),
			));
		}
		txs.push(raw);
	}

	// only the first transaction is validated at admission; the rest may
	// turn out invalid during processing
	match node_client.validate_tx(&txs[0]).await {
		Ok(verdict) if !verdict.valid => {
			return Ok(error_reply(
				StatusCode::BAD_REQUEST,
				ApiError::invalid_parameter_value(
					"transactions",
					"The first transaction is invalid.",
					Some(serde_json::json!({
						"errorMessage": verdict.error_message.unwrap_or_default()
					})),
				),
			));
		},
		Ok(_) => {},
		Err(node_error) => {
			error!("Cannot validate the first tx of a sequence: {node_error}");
			return Ok(error_reply(
				StatusCode::INTERNAL_SERVER_ERROR,
				ApiError::internal_server_error(),
			));
		},
	}

	let sequence_id = match store.create_sequence(txs).await {
		Ok(sequence_id) => sequence_id,
		Err(store_error) => {
			error!("Cannot create sequence: {store_error:#}");
			return Ok(error_reply(
				StatusCode::INTERNAL_SERVER_ERROR,
				ApiError::internal_server_error(),
			));
		},
	};

	// best-effort: the dispatcher's discovery pass picks the sequence up anyway
	let _ = nudge.try_send(sequence_id);

	debug!(sequence_id, "Sequence created");
	Ok(reply::with_status(
		reply::json(&CreateSequenceResponse { id: sequence_id }),
		StatusCode::CREATED,
	))
}
