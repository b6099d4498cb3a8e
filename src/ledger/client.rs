//! Ledger client contract and the GraphQL event gateway client.
//!
//! The sync components only see the [`LedgerClient`] trait. [`GraphqlLedgerClient`] implements it
//! against a contract event gateway: paginated HTTP queries for historical ranges and a
//! `graphql-transport-ws` subscription per event kind for live delivery.

use super::types::*;
use crate::config::LedgerConfig;
use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use reqwest::Client;
use serde_json::json;
use std::pin::Pin;
use std::time::Duration;
use tokio_tungstenite::{
	connect_async,
	tungstenite::{Message, client::IntoClientRequest},
};
use tracing::{debug, info, warn};

/// A live feed of raw logs for one event kind. Dropping the stream unsubscribes.
pub type LogStream = Pin<Box<dyn Stream<Item = Result<RawLog, LedgerError>> + Send>>;

/// Read-only access to the ledger.
#[async_trait]
pub trait LedgerClient: Send + Sync {
	/// Current head block number.
	async fn latest_block(&self) -> Result<u64, LedgerError>;

	/// All logs of `kind` in the closed range `[from_block, to_block]`, ordered by
	/// (block number, log index).
	async fn query_events(
		&self,
		kind: EventKind,
		from_block: u64,
		to_block: u64,
	) -> Result<Vec<RawLog>, LedgerError>;

	/// Open a live subscription for `kind`.
	async fn subscribe(&self, kind: EventKind) -> Result<LogStream, LedgerError>;

	/// Get the name of this client for logging and diagnostics.
	fn name(&self) -> &'static str;
}

const LATEST_BLOCK_QUERY: &str = r#"
    query LatestBlock {
        latestBlock {
            number
        }
    }
"#;

const CONTRACT_EVENTS_QUERY: &str = r#"
    query ContractEvents($contract: String!, $name: String!, $fromBlock: String!, $toBlock: String!, $offset: Int!, $limit: Int!) {
        contractEvents(contract: $contract, name: $name, fromBlock: $fromBlock, toBlock: $toBlock, offset: $offset, limit: $limit) {
            event
            blockNumber
            logIndex
            transactionHash
            blockTimestamp
            args
        }
    }
"#;

const CONTRACT_EVENTS_SUBSCRIPTION: &str = r#"
    subscription ContractEvents($contract: String!, $name: String!) {
        contractEvents(contract: $contract, name: $name) {
            event
            blockNumber
            logIndex
            transactionHash
            blockTimestamp
            args
        }
    }
"#;

/// GraphQL client for the contract event gateway
#[derive(Clone)]
pub struct GraphqlLedgerClient {
	/// The underlying HTTP client for GraphQL queries.
	http_client: Client,
	/// The gateway GraphQL HTTP endpoint.
	http_url: String,
	/// The WebSocket URL for live subscriptions.
	ws_url: String,
	/// Address of the relief contract whose events are read.
	contract_address: String,
	/// Events fetched per query page.
	page_size: u32,
	/// Bound on connecting and completing the subscription handshake.
	handshake_timeout: Duration,
}

impl GraphqlLedgerClient {
	/// Create a new gateway client from configuration.
	///
	/// Fails fast when an endpoint is not a valid URL or the HTTP client cannot be built.
	pub fn new(config: &LedgerConfig) -> Result<Self, LedgerError> {
		reqwest::Url::parse(&config.http_url)
			.map_err(|e| LedgerError::Config(format!("invalid http_url {}: {}", config.http_url, e)))?;
		reqwest::Url::parse(&config.ws_url)
			.map_err(|e| LedgerError::Config(format!("invalid ws_url {}: {}", config.ws_url, e)))?;

		let http_client = Client::builder()
			.timeout(Duration::from_secs(config.request_timeout_secs))
			.build()?;

		Ok(Self {
			http_client,
			http_url: config.http_url.clone(),
			ws_url: config.ws_url.clone(),
			contract_address: config.contract_address.to_lowercase(),
			page_size: config.page_size,
			handshake_timeout: Duration::from_secs(config.request_timeout_secs),
		})
	}

	/// Execute a GraphQL query and return the `data` object.
	pub async fn execute_query(
		&self,
		query: &str,
		variables: Option<serde_json::Value>,
	) -> Result<serde_json::Value, LedgerError> {
		let request_body = json!({
			"query": query,
			"variables": variables
		});

		let response = self
			.http_client
			.post(&self.http_url)
			.header("Content-Type", "application/json")
			.json(&request_body)
			.send()
			.await?;

		if !response.status().is_success() {
			return Err(LedgerError::GraphQLError(format!(
				"HTTP error: {}",
				response.status()
			)));
		}

		let mut response_json: serde_json::Value = response.json().await?;

		if let Some(errors) = response_json.get("errors") {
			return Err(LedgerError::GraphQLError(format!(
				"GraphQL errors: {}",
				errors
			)));
		}

		match response_json.get_mut("data") {
			Some(data) if !data.is_null() => Ok(data.take()),
			_ => Err(LedgerError::NoData),
		}
	}

	async fn fetch_page(
		&self,
		kind: EventKind,
		from_block: u64,
		to_block: u64,
		offset: u64,
	) -> Result<Vec<RawLog>, LedgerError> {
		let variables = json!({
			"contract": self.contract_address,
			"name": kind.signature(),
			"fromBlock": from_block.to_string(),
			"toBlock": to_block.to_string(),
			"offset": offset,
			"limit": self.page_size,
		});

		let mut data = self
			.execute_query(CONTRACT_EVENTS_QUERY, Some(variables))
			.await?;
		let rows = match data.get_mut("contractEvents").map(serde_json::Value::take) {
			Some(serde_json::Value::Array(rows)) => rows,
			Some(other) => {
				return Err(LedgerError::GraphQLError(format!(
					"contractEvents is not a list: {}",
					other
				)));
			}
			None => return Err(LedgerError::NoData),
		};

		// Rows are read one by one so a single odd row does not fail the page
		Ok(rows
			.iter()
			.map(|row| RawLog::from_gateway_row(kind, row))
			.collect())
	}
}

#[async_trait]
impl LedgerClient for GraphqlLedgerClient {
	async fn latest_block(&self) -> Result<u64, LedgerError> {
		let data = self.execute_query(LATEST_BLOCK_QUERY, None).await?;

		let number = data
			.get("latestBlock")
			.and_then(|block| block.get("number"))
			.ok_or(LedgerError::NoData)?;

		// The gateway reports big block numbers as strings
		parse_u64(number)
			.ok_or_else(|| LedgerError::GraphQLError(format!("invalid block number: {}", number)))
	}

	async fn query_events(
		&self,
		kind: EventKind,
		from_block: u64,
		to_block: u64,
	) -> Result<Vec<RawLog>, LedgerError> {
		let mut events = Vec::new();
		let mut offset = 0u64;

		loop {
			let page = self.fetch_page(kind, from_block, to_block, offset).await?;
			let page_len = page.len();
			debug!(
				kind = %kind,
				from_block,
				to_block,
				offset,
				page_len,
				"Fetched contract events page"
			);
			events.extend(page);

			if page_len < self.page_size as usize {
				break;
			}
			offset += page_len as u64;
		}

		events.sort_by_key(RawLog::position);
		Ok(events)
	}

	async fn subscribe(&self, kind: EventKind) -> Result<LogStream, LedgerError> {
		debug!("Attempting WebSocket connection to: {}", self.ws_url);

		// Create WebSocket request with required subprotocol
		let mut request = self.ws_url.clone().into_client_request()?;
		request.headers_mut().insert(
			"Sec-WebSocket-Protocol",
			"graphql-transport-ws".parse().map_err(|_| {
				LedgerError::GraphQLError("Invalid WebSocket subprotocol header value".to_string())
			})?,
		);

		let handshake = async {
			let (ws_stream, response) = connect_async(request).await?;
			debug!(
				"WebSocket connection established, response status: {}",
				response.status()
			);
			let (mut ws_sender, mut ws_receiver) = ws_stream.split();

			let init_message = json!({
				"type": "connection_init"
			});
			ws_sender
				.send(Message::Text(init_message.to_string()))
				.await?;

			match ws_receiver.next().await {
				Some(msg) => match msg? {
					Message::Text(text) => {
						let parsed: serde_json::Value = serde_json::from_str(&text)?;
						if parsed.get("type").and_then(|t| t.as_str()) != Some("connection_ack") {
							return Err(LedgerError::SessionError(
								"Connection not acknowledged".to_string(),
							));
						}
					}
					_ => {
						return Err(LedgerError::SessionError(
							"Unexpected message type during handshake".to_string(),
						));
					}
				},
				None => {
					return Err(LedgerError::SessionError(
						"Connection closed during handshake".to_string(),
					));
				}
			}

			let start_message = json!({
				"id": format!("events-{}", kind.signature()),
				"type": "subscribe",
				"payload": {
					"query": CONTRACT_EVENTS_SUBSCRIPTION,
					"variables": {
						"contract": self.contract_address,
						"name": kind.signature(),
					}
				}
			});

			ws_sender
				.send(Message::Text(start_message.to_string()))
				.await?;
			Ok::<_, LedgerError>((ws_sender, ws_receiver))
		};

		let (ws_sender, ws_receiver) =
			match tokio::time::timeout(self.handshake_timeout, handshake).await {
				Ok(session) => session?,
				Err(_) => return Err(LedgerError::Timeout(self.handshake_timeout)),
			};

		info!(kind = %kind, "Subscribed to live contract events");

		// The sink lives as long as the stream so the connection closes when it is dropped
		let stream = ws_receiver.filter_map(move |msg| {
			let _sink = &ws_sender;
			async move {
				match msg {
					Ok(Message::Text(text)) => parse_subscription_message(kind, &text),
					Ok(Message::Close(_)) => Some(Err(LedgerError::SessionError(
						"Gateway closed the subscription".to_string(),
					))),
					// Pings and binary frames carry no events
					Ok(_) => None,
					Err(e) => Some(Err(LedgerError::WebSocketError(e))),
				}
			}
		});

		Ok(Box::pin(stream))
	}

	fn name(&self) -> &'static str {
		"GraphqlLedgerClient"
	}
}

/// Translate one `graphql-transport-ws` frame into a stream item.
fn parse_subscription_message(kind: EventKind, text: &str) -> Option<Result<RawLog, LedgerError>> {
	let parsed = match serde_json::from_str::<serde_json::Value>(text) {
		Ok(parsed) => parsed,
		Err(e) => return Some(Err(LedgerError::JsonError(e))),
	};

	let Some(msg_type) = parsed.get("type").and_then(|t| t.as_str()) else {
		return Some(Err(LedgerError::GraphQLError(
			"Message missing type field".to_string(),
		)));
	};

	match msg_type {
		"next" => {
			let Some(event) = parsed
				.get("payload")
				.and_then(|p| p.get("data"))
				.and_then(|d| d.get("contractEvents"))
			else {
				return Some(Err(LedgerError::NoData));
			};
			let log = RawLog::from_gateway_row(kind, event);
			if let Some(reason) = &log.malformed {
				warn!("Unreadable {} event at {}: {}", kind, log.position(), reason);
			}
			Some(Ok(log))
		}
		"error" => {
			let error_msg = parsed
				.get("payload")
				.and_then(|p| p.get(0).or(Some(p)))
				.and_then(|p| p.get("message"))
				.and_then(|m| m.as_str())
				.unwrap_or("Unknown subscription error");
			Some(Err(LedgerError::GraphQLError(error_msg.to_string())))
		}
		"complete" => Some(Err(LedgerError::SessionError(
			"Subscription completed by gateway".to_string(),
		))),
		_ => {
			debug!("Ignoring message type: {}", msg_type);
			None
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn next_frame_yields_raw_log() {
		let frame = json!({
			"id": "events-FundsDistributed",
			"type": "next",
			"payload": {
				"data": {
					"contractEvents": {
						"event": "FundsDistributed",
						"blockNumber": 42,
						"logIndex": 3,
						"transactionHash": "0xabc",
						"blockTimestamp": 1700000000,
						"args": { "amount": "500" }
					}
				}
			}
		})
		.to_string();

		let log = parse_subscription_message(EventKind::FundsDistributed, &frame)
			.expect("frame should produce an item")
			.expect("frame should decode");
		assert_eq!(log.event, "FundsDistributed");
		assert_eq!(log.position(), LogPosition { block_number: 42, log_index: 3 });
		assert_eq!(log.block_timestamp, Some(1_700_000_000));
	}

	#[test]
	fn error_and_complete_frames_end_in_errors() {
		let error_frame = json!({
			"id": "x",
			"type": "error",
			"payload": [{ "message": "contract not indexed" }]
		})
		.to_string();
		match parse_subscription_message(EventKind::FundsDistributed, &error_frame) {
			Some(Err(LedgerError::GraphQLError(msg))) => assert_eq!(msg, "contract not indexed"),
			other => panic!("unexpected: {:?}", other),
		}

		let complete_frame = json!({ "id": "x", "type": "complete" }).to_string();
		assert!(matches!(
			parse_subscription_message(EventKind::FundsDistributed, &complete_frame),
			Some(Err(LedgerError::SessionError(_)))
		));
	}

	#[test]
	fn odd_rows_do_not_end_the_feed() {
		let frame = json!({
			"id": "events-FundsDistributed",
			"type": "next",
			"payload": {
				"data": {
					"contractEvents": {
						"event": "FundsDistributed",
						"blockNumber": 42,
						"logIndex": null,
						"transactionHash": "0xabc",
						"args": {}
					}
				}
			}
		})
		.to_string();

		let log = parse_subscription_message(EventKind::FundsDistributed, &frame)
			.expect("frame should produce an item")
			.expect("unreadable rows are still delivered");
		assert!(log.malformed.is_some());
		assert_eq!(log.block_number, 42);
	}

	#[test]
	fn keepalive_frames_are_ignored() {
		let ping = json!({ "type": "ping" }).to_string();
		assert!(parse_subscription_message(EventKind::FundsDistributed, &ping).is_none());
	}

	#[test]
	fn invalid_urls_fail_fast() {
		let config = LedgerConfig {
			http_url: "not a url".to_string(),
			ws_url: "ws://localhost:4000/graphql".to_string(),
			contract_address: "0x0000000000000000000000000000000000000001".to_string(),
			request_timeout_secs: 5,
			page_size: 100,
		};
		assert!(matches!(
			GraphqlLedgerClient::new(&config),
			Err(LedgerError::Config(_))
		));
	}
}
