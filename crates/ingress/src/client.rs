//! Typed client for the management API, used by the connector and external
//! tooling.

use faros_core::prelude::*;
use serde::de::DeserializeOwned;

use crate::http::StatusCode;
use crate::types::{ApiError, Connection, ConnectionGateway, ConnectionList};

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
	#[error(transparent)]
	Request(#[from] reqwest::Error),
	#[error("api error ({status}): {message}")]
	Api { status: StatusCode, message: String },
}

pub struct ApiClient {
	base: String,
	access_key: String,
	http: reqwest::Client,
}

impl ApiClient {
	pub fn new(
		base_url: &str,
		access_key: impl Into<String>,
		insecure_skip_verify: bool,
	) -> Result<ApiClient, ClientError> {
		let mut builder = reqwest::Client::builder();
		if insecure_skip_verify {
			builder = builder.danger_accept_invalid_certs(true);
		}
		Ok(ApiClient {
			base: format!("{}{}", base_url.trim_end_matches('/'), crate::types::API_PREFIX),
			access_key: access_key.into(),
			http: builder.build()?,
		})
	}

	pub fn set_access_key(&mut self, access_key: impl Into<String>) {
		self.access_key = access_key.into();
	}

	pub async fn list_connections(&self) -> Result<ConnectionList, ClientError> {
		self.send(self.http.get(self.url(&["connections"]))).await
	}

	pub async fn get_connection(&self, id: &str) -> Result<Connection, ClientError> {
		self.send(self.http.get(self.url(&["connections", id]))).await
	}

	pub async fn create_connection(&self, conn: &Connection) -> Result<Connection, ClientError> {
		self
			.send(self.http.post(self.url(&["connections"])).json(conn))
			.await
	}

	pub async fn update_connection(&self, conn: &Connection) -> Result<Connection, ClientError> {
		self
			.send(self.http.put(self.url(&["connections", &conn.id])).json(conn))
			.await
	}

	pub async fn delete_connection(&self, id: &str) -> Result<(), ClientError> {
		let resp = self
			.http
			.delete(self.url(&["connections", id]))
			.bearer_auth(&self.access_key)
			.send()
			.await?;
		Self::check(resp).await?;
		Ok(())
	}

	/// Resolves which gateway the connection should dial.
	pub async fn get_connection_gateway(&self, id: &str) -> Result<ConnectionGateway, ClientError> {
		self
			.send(self.http.get(self.url(&["connection-gateways", id])))
			.await
	}

	fn url(&self, segments: &[&str]) -> String {
		let mut url = self.base.clone();
		for segment in segments {
			url.push('/');
			url.push_str(segment);
		}
		url
	}

	async fn send<T: DeserializeOwned>(
		&self,
		req: reqwest::RequestBuilder,
	) -> Result<T, ClientError> {
		let resp = req.bearer_auth(&self.access_key).send().await?;
		let resp = Self::check(resp).await?;
		Ok(resp.json().await?)
	}

	async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
		let status = resp.status();
		if status.is_success() {
			return Ok(resp);
		}
		let message = match resp.json::<ApiError>().await {
			Ok(body) => body.error,
			Err(_) => status
				.canonical_reason()
				.unwrap_or("request failed")
				.to_string(),
		};
		Err(ClientError::Api { status, message })
	}
}
