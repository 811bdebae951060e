//! HTTP transport against an in-process axum server

use axum::{
	extract::{Multipart, Path, State},
	http::{header::CONTENT_TYPE, HeaderMap, Method, StatusCode},
	response::{IntoResponse, Response},
	routing::{patch, post},
	Json, Router,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use spectral_core::{
	domain::{LocalId, Payload, RecordType, ServerId},
	infra::queue::{EntryId, SyncAction},
	service::sync::{HttpTransport, OutboundRequest, Transport, TransportError},
};
use std::{
	net::{SocketAddr, TcpListener},
	sync::{Arc, Mutex},
	time::Duration,
};
use tracing_test::traced_test;

#[derive(Debug, Clone, PartialEq)]
struct ReceivedPart {
	name: String,
	file_name: Option<String>,
	content_type: Option<String>,
	data: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Received {
	method: Method,
	path: String,
	content_type: Option<String>,
	json: Option<Value>,
	parts: Vec<ReceivedPart>,
}

type Log = Arc<Mutex<Vec<Received>>>;

fn content_type(headers: &HeaderMap) -> Option<String> {
	headers
		.get(CONTENT_TYPE)
		.and_then(|value| value.to_str().ok())
		.map(ToString::to_string)
}

async fn create_session(
	State(log): State<Log>,
	headers: HeaderMap,
	Json(body): Json<Value>,
) -> Response {
	let omit_id = body.get("omit_id").is_some();

	log.lock().unwrap().push(Received {
		method: Method::POST,
		path: "/sessions".to_string(),
		content_type: content_type(&headers),
		json: Some(body),
		parts: Vec::new(),
	});

	if omit_id {
		Json(json!({ "ok": true })).into_response()
	} else {
		Json(json!({ "id": "S1" })).into_response()
	}
}

async fn update_session(
	State(log): State<Log>,
	Path(id): Path<String>,
	Json(body): Json<Value>,
) -> StatusCode {
	log.lock().unwrap().push(Received {
		method: Method::PATCH,
		path: format!("/sessions/{id}"),
		content_type: None,
		json: Some(body),
		parts: Vec::new(),
	});

	StatusCode::NO_CONTENT
}

async fn create_detection(
	State(log): State<Log>,
	Path((session_id, kind)): Path<(String, String)>,
	headers: HeaderMap,
	mut multipart: Multipart,
) -> Response {
	let mut parts = Vec::new();
	while let Some(field) = multipart.next_field().await.unwrap() {
		let name = field.name().unwrap_or_default().to_string();
		let file_name = field.file_name().map(ToString::to_string);
		let content_type = field.content_type().map(ToString::to_string);
		let data = field.bytes().await.unwrap().to_vec();

		parts.push(ReceivedPart {
			name,
			file_name,
			content_type,
			data,
		});
	}

	log.lock().unwrap().push(Received {
		method: Method::POST,
		path: format!("/sessions/{session_id}/{kind}"),
		content_type: content_type(&headers),
		json: None,
		parts,
	});

	if kind == "radar" {
		return (StatusCode::INTERNAL_SERVER_ERROR, "sensor backend down").into_response();
	}

	Json(json!({ "id": 77 })).into_response()
}

async fn serve() -> (String, Log) {
	let log = Log::default();

	let app = Router::new()
		.route("/api/sessions", post(create_session))
		.route("/api/sessions/:id", patch(update_session))
		.route("/api/sessions/:session_id/:kind", post(create_detection))
		.with_state(Arc::clone(&log));

	let listener = TcpListener::bind("127.0.0.1:0").unwrap();
	let addr = listener.local_addr().unwrap();

	tokio::spawn(async move {
		axum::Server::from_tcp(listener)
			.unwrap()
			.serve(app.into_make_service())
			.await
			.unwrap();
	});

	(format!("http://{addr}/api/"), log)
}

fn transport(api_url: &str) -> HttpTransport {
	HttpTransport::new(api_url, Duration::from_secs(5)).unwrap()
}

fn request(record_type: RecordType, action: SyncAction, payload: Payload) -> OutboundRequest {
	OutboundRequest {
		entry_id: EntryId::new(),
		record_type,
		action,
		local_id: LocalId::new(),
		server_id: None,
		session_id: None,
		payload,
	}
}

#[tokio::test]
#[traced_test]
async fn session_create_is_sent_as_json() {
	let (api_url, log) = serve().await;
	let transport = transport(&api_url);

	let metadata = json!({ "location": "old mill", "investigators": 3 });
	let ack = transport
		.send(&request(
			RecordType::Session,
			SyncAction::Create,
			Payload::new(metadata.clone()),
		))
		.await
		.unwrap();
	assert_eq!(ack.server_id, Some(ServerId::new("S1")));

	let received = log.lock().unwrap().clone();
	assert_eq!(received.len(), 1);
	assert_eq!(received[0].path, "/sessions");
	assert_eq!(received[0].content_type.as_deref(), Some("application/json"));
	assert_eq!(received[0].json, Some(metadata));
}

#[tokio::test]
#[traced_test]
async fn binary_detection_create_is_sent_as_multipart() {
	let (api_url, log) = serve().await;
	let transport = transport(&api_url);

	let metadata = json!({ "db": -38.2, "duration_ms": 1800 });
	let mut evp = request(
		RecordType::Evp,
		SyncAction::Create,
		Payload::new(metadata.clone()).with_attachment(
			"audio",
			"evp.wav",
			"audio/wav",
			vec![82, 73, 70, 70],
		),
	);
	evp.session_id = Some("S1".to_string());

	let ack = transport.send(&evp).await.unwrap();
	assert_eq!(ack.server_id, Some(ServerId::new("77")));

	let received = log.lock().unwrap().clone();
	assert_eq!(received[0].path, "/sessions/S1/evp");
	assert!(received[0]
		.content_type
		.as_deref()
		.is_some_and(|ct| ct.starts_with("multipart/form-data")));

	let parts = &received[0].parts;
	assert_eq!(parts.len(), 2);
	assert_eq!(parts[0].name, "metadata");
	assert_eq!(
		serde_json::from_slice::<Value>(&parts[0].data).unwrap(),
		metadata
	);
	assert_eq!(
		parts[1],
		ReceivedPart {
			name: "audio".to_string(),
			file_name: Some("evp.wav".to_string()),
			content_type: Some("audio/wav".to_string()),
			data: vec![82, 73, 70, 70],
		}
	);
}

#[tokio::test]
#[traced_test]
async fn update_is_patched_to_the_record_resource() {
	let (api_url, log) = serve().await;
	let transport = transport(&api_url);

	let mut update = request(
		RecordType::Session,
		SyncAction::Update,
		Payload::new(json!({ "notes": "cold spot in the attic" })),
	);
	update.server_id = Some(ServerId::new("S1"));

	let ack = transport.send(&update).await.unwrap();
	assert_eq!(ack.server_id, None);

	let received = log.lock().unwrap().clone();
	assert_eq!(received[0].method, Method::PATCH);
	assert_eq!(received[0].path, "/sessions/S1");
}

#[tokio::test]
#[traced_test]
async fn failures_map_to_transport_errors() {
	let (api_url, _log) = serve().await;
	let transport = transport(&api_url);

	let mut radar = request(
		RecordType::Radar,
		SyncAction::Create,
		Payload::new(json!({})).with_attachment("frame", "f.png", "image/png", vec![0]),
	);
	radar.session_id = Some("S1".to_string());
	assert_eq!(
		transport.send(&radar).await,
		Err(TransportError::Status {
			status: 500,
			body: "sensor backend down".to_string(),
		})
	);

	let missing_id = request(
		RecordType::Session,
		SyncAction::Create,
		Payload::new(json!({ "omit_id": true })),
	);
	assert!(matches!(
		transport.send(&missing_id).await,
		Err(TransportError::InvalidResponse(_))
	));

	// Nothing listens on a port we just released
	let closed: SocketAddr = {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		listener.local_addr().unwrap()
	};
	let unreachable = HttpTransport::new(format!("http://{closed}"), Duration::from_secs(2)).unwrap();
	assert!(matches!(
		unreachable
			.send(&request(RecordType::Session, SyncAction::Create, Payload::default()))
			.await,
		Err(TransportError::Network(_))
	));
}
