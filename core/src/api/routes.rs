use super::handlers;
use crate::{node, store::Store};
use std::{convert::Infallible, sync::Arc};
use tokio::sync::mpsc;
use warp::{Filter, Rejection, Reply};

fn with_store<S: Store>(
	store: Arc<S>,
) -> impl Filter<Extract = (Arc<S>,), Error = Infallible> + Clone {
	warp::any().map(move || store.clone())
}

fn with_node_client<N: node::Client>(
	node_client: Arc<N>,
) -> impl Filter<Extract = (Arc<N>,), Error = Infallible> + Clone {
	warp::any().map(move || node_client.clone())
}

fn with_nudge(
	nudge: mpsc::Sender<i64>,
) -> impl Filter<Extract = (mpsc::Sender<i64>,), Error = Infallible> + Clone {
	warp::any().map(move || nudge.clone())
}

pub fn get_sequence_route<S: Store + 'static>(
	store: Arc<S>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
	warp::path!("sequences" / i64)
		.and(warp::get())
		.and(with_store(store))
		.and_then(handlers::get_sequence)
}

pub fn create_sequence_route<S, N>(
	store: Arc<S>,
	node_client: Arc<N>,
	nudge: mpsc::Sender<i64>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone
where
	S: Store + 'static,
	N: node::Client + 'static,
{
	warp::path!("sequences")
		.and(warp::post())
		.and(warp::body::content_length_limit(1024 * 1024))
		.and(warp::body::json())
		.and(with_store(store))
		.and(with_node_client(node_client))
		.and(with_nudge(nudge))
		.and_then(handlers::create_sequence)
}

pub fn routes<S, N>(
	store: Arc<S>,
	node_client: Arc<N>,
	nudge: mpsc::Sender<i64>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone
where
	S: Store + 'static,
	N: node::Client + 'static,
{
	get_sequence_route(store.clone()).or(create_sequence_route(store, node_client, nudge))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		api::server::handle_rejection,
		node::{MockClient, ValidationResult},
		store::MemoryStore,
		types::SequenceState,
	};
	use warp::http::StatusCode;

	fn valid_node_client() -> Arc<MockClient> {
		let mut node_client = MockClient::new();
		node_client.expect_validate_tx().returning(|_| {
			Ok(ValidationResult {
				valid: true,
				error_message: None,
			})
		});
		Arc::new(node_client)
	}

	fn test_routes(
		store: Arc<MemoryStore>,
		node_client: Arc<MockClient>,
		nudge_tx: mpsc::Sender<i64>,
	) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
		routes(store, node_client, nudge_tx).recover(handle_rejection)
	}

	fn nudge_channel() -> (mpsc::Sender<i64>, mpsc::Receiver<i64>) {
		mpsc::channel(16)
	}

	#[tokio::test]
	async fn get_sequence_returns_counts_and_state() {
		let store = Arc::new(MemoryStore::default());
		let sequence_id = store
			.create_sequence(vec![r#"{"type":4}"#.to_string(), r#"{"type":5}"#.to_string()])
			.await
			.unwrap();
		store
			.set_sequence_tx_confirmed_state(sequence_id, 0, 100)
			.await
			.unwrap();

		let (nudge_tx, _nudge_rx) = nudge_channel();
		let filter = test_routes(store, valid_node_client(), nudge_tx);
		let response = warp::test::request()
			.method("GET")
			.path(&format!("/sequences/{sequence_id}"))
			.reply(&filter)
			.await;

		assert_eq!(response.status(), StatusCode::OK);
		let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
		assert_eq!(body["id"], sequence_id);
		assert_eq!(body["broadcastedCount"], 1);
		assert_eq!(body["totalCount"], 2);
		assert_eq!(body["state"], "pending");
		assert!(body["createdAt"].is_i64());
	}

	#[tokio::test]
	async fn get_unknown_sequence_is_not_found() {
		let (nudge_tx, _nudge_rx) = nudge_channel();
		let filter = test_routes(Arc::new(MemoryStore::default()), valid_node_client(), nudge_tx);

		let response = warp::test::request()
			.method("GET")
			.path("/sequences/42")
			.reply(&filter)
			.await;

		assert_eq!(response.status(), StatusCode::NOT_FOUND);
		assert_eq!(response.body(), r#"{"message":"Sequence not found"}"#);
	}

	#[tokio::test]
	async fn create_sequence_persists_and_nudges() {
		let store = Arc::new(MemoryStore::default());
		let (nudge_tx, mut nudge_rx) = nudge_channel();
		let filter = test_routes(store.clone(), valid_node_client(), nudge_tx);

		let response = warp::test::request()
			.method("POST")
			.path("/sequences")
			.json(&serde_json::json!({
				"transactions": [{ "type": 4, "timestamp": 1 }, { "type": 5, "timestamp": 2 }]
			}))
			.reply(&filter)
			.await;

		assert_eq!(response.status(), StatusCode::CREATED);
		let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
		let sequence_id = body["id"].as_i64().unwrap();

		let sequence = store
			.get_sequence_by_id(sequence_id)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(sequence.state, SequenceState::Pending);
		assert_eq!(sequence.total_count, 2);

		assert_eq!(nudge_rx.recv().await, Some(sequence_id));
	}

	#[tokio::test]
	async fn create_sequence_rejects_empty_batch() {
		let (nudge_tx, _nudge_rx) = nudge_channel();
		let filter = test_routes(Arc::new(MemoryStore::default()), valid_node_client(), nudge_tx);

		let response = warp::test::request()
			.method("POST")
			.path("/sequences")
			.json(&serde_json::json!({ "transactions": [] }))
			.reply(&filter)
			.await;

		assert_eq!(response.status(), StatusCode::BAD_REQUEST);
		let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
		assert_eq!(body["errors"][0]["code"], 10201);
	}

	#[tokio::test]
	async fn create_sequence_rejects_duplicates_with_positions() {
		let (nudge_tx, _nudge_rx) = nudge_channel();
		let filter = test_routes(Arc::new(MemoryStore::default()), valid_node_client(), nudge_tx);

		let response = warp::test::request()
			.method("POST")
			.path("/sequences")
			.json(&serde_json::json!({
				"transactions": [
					{ "type": 4, "timestamp": 1 },
					{ "type": 5, "timestamp": 2 },
					{ "type": 4, "timestamp": 1 }
				]
			}))
			.reply(&filter)
			.await;

		assert_eq!(response.status(), StatusCode::BAD_REQUEST);
		let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
		assert_eq!(body["errors"][0]["code"], 10201);
		assert_eq!(
			body["errors"][0]["details"]["duplicates"],
			serde_json::json!([0, 2])
		);
	}

	#[tokio::test]
	async fn create_sequence_rejects_invalid_first_tx() {
		let mut node_client = MockClient::new();
		node_client.expect_validate_tx().returning(|_| {
			Ok(ValidationResult {
				valid: false,
				error_message: Some("State check failed. Reason: negative balance".to_string()),
			})
		});

		let (nudge_tx, _nudge_rx) = nudge_channel();
		let filter = test_routes(Arc::new(MemoryStore::default()), Arc::new(node_client), nudge_tx);

		let response = warp::test::request()
			.method("POST")
			.path("/sequences")
			.json(&serde_json::json!({ "transactions": [{ "type": 4 }] }))
			.reply(&filter)
			.await;

		assert_eq!(response.status(), StatusCode::BAD_REQUEST);
		let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
		assert_eq!(
			body["errors"][0]["details"]["errorMessage"],
			"State check failed. Reason: negative balance"
		);
	}

	#[tokio::test]
	async fn malformed_body_is_a_bad_request() {
		let (nudge_tx, _nudge_rx) = nudge_channel();
		let filter = test_routes(Arc::new(MemoryStore::default()), valid_node_client(), nudge_tx);

		let response = warp::test::request()
			.method("POST")
			.path("/sequences")
			.header("content-type", "application/json")
			.body("{not json")
			.reply(&filter)
			.await;

		assert_eq!(response.status(), StatusCode::BAD_REQUEST);
		let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
		assert_eq!(body["errors"][0]["code"], 10201);
	}
}
