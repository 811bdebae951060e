use super::{Method, OutboundRequest, Route, ServerAck, Transport, TransportError};
use crate::{domain::ServerId, infra::queue::SyncAction};
use async_trait::async_trait;
use reqwest::{
	multipart::{Form, Part},
	Url,
};
use std::time::Duration;
use tracing::{debug, trace};

/// JSON/multipart transport talking to the capture API
pub struct HttpTransport {
	client: reqwest::Client,
	api_url: Url,
}

impl HttpTransport {
	pub fn new(api_url: impl AsRef<str>, timeout: Duration) -> Result<Self, TransportError> {
		let client = reqwest::Client::builder()
			.timeout(timeout)
			.build()
			.map_err(|e| TransportError::Request(e.to_string()))?;

		Self::with_client(client, api_url)
	}

	pub fn with_client(
		client: reqwest::Client,
		api_url: impl AsRef<str>,
	) -> Result<Self, TransportError> {
		let raw = api_url.as_ref();
		let api_url = Url::parse(raw)
			.map_err(|e| TransportError::Request(format!("invalid api url '{raw}': {e}")))?;

		if api_url.cannot_be_a_base() {
			return Err(not_a_base(&api_url));
		}

		Ok(Self { client, api_url })
	}

	pub fn api_url(&self) -> &Url {
		&self.api_url
	}

	/// Full url of a route, each segment percent-encoded
	fn url_for(&self, route: &Route) -> Result<Url, TransportError> {
		let mut url = self.api_url.clone();
		url.path_segments_mut()
			.map_err(|()| not_a_base(&self.api_url))?
			.pop_if_empty()
			.extend(&route.segments);

		Ok(url)
	}

	fn multipart(request: &OutboundRequest) -> Result<Form, TransportError> {
		let metadata = serde_json::to_string(&request.payload.metadata)
			.map_err(|e| TransportError::Request(e.to_string()))?;

		let mut form = Form::new().text("metadata", metadata);
		for attachment in &request.payload.attachments {
			let part = Part::bytes(attachment.data.clone())
				.file_name(attachment.file_name.clone())
				.mime_str(&attachment.content_type)
				.map_err(|e| TransportError::Request(e.to_string()))?;

			form = form.part(attachment.field.clone(), part);
		}

		Ok(form)
	}
}

#[async_trait]
impl Transport for HttpTransport {
	async fn send(&self, request: &OutboundRequest) -> Result<ServerAck, TransportError> {
		let route = Route::for_request(request)?;
		let url = self.url_for(&route)?;

		let builder = match route.method {
			Method::Post => self.client.post(url.clone()),
			Method::Patch => self.client.patch(url.clone()),
		};

		let builder = if request.is_multipart() {
			builder.multipart(Self::multipart(request)?)
		} else {
			builder.json(&request.payload.metadata)
		};

		debug!(
			entry_id = %request.entry_id,
			local_id = %request.local_id,
			method = ?route.method,
			%url,
			multipart = request.is_multipart(),
			"Sending sync request"
		);

		let response = builder
			.send()
			.await
			.map_err(|e| TransportError::Network(e.to_string()))?;

		let status = response.status();
		let body = response
			.bytes()
			.await
			.map_err(|e| TransportError::Network(e.to_string()))?;

		if !status.is_success() {
			return Err(TransportError::Status {
				status: status.as_u16(),
				body: String::from_utf8_lossy(&body).into_owned(),
			});
		}

		trace!(entry_id = %request.entry_id, %status, "Sync request acknowledged");

		let server_id = parse_ack_id(&body)?;
		if request.action == SyncAction::Create && server_id.is_none() {
			return Err(TransportError::InvalidResponse(
				"create acknowledged without an id".to_string(),
			));
		}

		Ok(ServerAck { server_id })
	}
}

fn not_a_base(api_url: &Url) -> TransportError {
	TransportError::Request(format!("api url '{api_url}' cannot be a base url"))
}

/// Pull `id` out of a JSON ack body. Empty bodies carry no id.
fn parse_ack_id(body: &[u8]) -> Result<Option<ServerId>, TransportError> {
	if body.iter().all(u8::is_ascii_whitespace) {
		return Ok(None);
	}

	let value: serde_json::Value = serde_json::from_slice(body)
		.map_err(|e| TransportError::InvalidResponse(e.to_string()))?;

	match value.get("id") {
		None | Some(serde_json::Value::Null) => Ok(None),
		Some(serde_json::Value::String(id)) if !id.is_empty() => Ok(Some(ServerId::new(id.clone()))),
		Some(serde_json::Value::Number(id)) => Ok(Some(ServerId::new(id.to_string()))),
		Some(other) => Err(TransportError::InvalidResponse(format!(
			"unexpected id value {other}"
		))),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	fn route(segments: &[&str]) -> Route {
		Route {
			method: Method::Patch,
			segments: segments.iter().map(ToString::to_string).collect(),
		}
	}

	#[test]
	fn url_keeps_the_api_prefix_and_encodes_segments() {
		for base in ["http://localhost:3000/api", "http://localhost:3000/api/"] {
			let transport = HttpTransport::new(base, Duration::from_secs(1)).unwrap();
			assert_eq!(
				transport.url_for(&route(&["sessions", "S1"])).unwrap().as_str(),
				"http://localhost:3000/api/sessions/S1"
			);
		}

		let transport = HttpTransport::new("http://localhost:3000", Duration::from_secs(1)).unwrap();
		assert_eq!(
			transport
				.url_for(&route(&["sessions", "a/b c?d#e"]))
				.unwrap()
				.as_str(),
			"http://localhost:3000/sessions/a%2Fb%20c%3Fd%23e"
		);
	}

	#[test]
	fn rejects_unusable_api_urls() {
		for base in ["not a url", "mailto:ops@example.com"] {
			assert!(matches!(
				HttpTransport::new(base, Duration::from_secs(1)),
				Err(TransportError::Request(_))
			));
		}
	}

	#[test]
	fn ack_id_accepts_strings_and_numbers() {
		assert_eq!(
			parse_ack_id(br#"{"id":"S1","ok":true}"#).unwrap(),
			Some(ServerId::new("S1"))
		);
		assert_eq!(
			parse_ack_id(br#"{"id":42}"#).unwrap(),
			Some(ServerId::new("42"))
		);
		assert_eq!(parse_ack_id(b"  ").unwrap(), None);
		assert_eq!(parse_ack_id(br#"{"ok":true}"#).unwrap(), None);

		assert!(matches!(
			parse_ack_id(b"<html>"),
			Err(TransportError::InvalidResponse(_))
		));
		assert!(matches!(
			parse_ack_id(br#"{"id":[1]}"#),
			Err(TransportError::InvalidResponse(_))
		));
	}
}
