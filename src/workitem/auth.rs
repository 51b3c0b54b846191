//! Acquires the `Authorization` header for azure devops requests.
//!
//! A personal access token is sent as basic auth. All other methods request an
//! oauth token for the azure devops resource from microsoft entra id (or the
//! instance metadata service for managed identities) and cache it until
//! shortly before it expires.

use std::{
	path::{Path, PathBuf},
	time::Duration,
};

use backoff::ExponentialBackoffBuilder;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr, PickFirst};
use thiserror::Error;
use tokio::{sync::Mutex, time::Instant};
use url::Url;

use crate::config::{AuthMethod, ReceiverConfig, Secret};

/// application id of azure devops
const AZURE_DEVOPS_RESOURCE: &str = "499b84ac-1321-427f-aa17-267ca6975798";
/// oauth scope granting access to azure devops
pub const AZURE_DEVOPS_SCOPE: &str = "499b84ac-1321-427f-aa17-267ca6975798/.default";

const AUTHORITY: &str = "https://login.microsoftonline.com";
const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// tokens are renewed this long before they expire
const EXPIRY_MARGIN: Duration = Duration::from_secs(300);

/// Error while acquiring credentials
#[derive(Error, Debug)]
pub enum AuthError {
	#[error("no valid authentication method configured")]
	NoMethod,
	#[error("failed to read token file {path:?}")]
	TokenFile {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("invalid token endpoint")]
	Endpoint(#[from] url::ParseError),
	#[error("token request failed")]
	Request(#[from] reqwest::Error),
	#[error("token endpoint answered with status {status}: {body}")]
	Status { status: StatusCode, body: String },
}

/// The credential of a receiver
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credential {
	ServicePrincipal { tenant_id: String, client_id: String, client_secret: Secret },
	/// federated credential, the client assertion is read from `token_file`
	WorkloadIdentity { tenant_id: String, client_id: String, token_file: PathBuf },
	ManagedIdentity { client_id: String },
	PersonalAccessToken(Secret),
}

impl Credential {
	/// Selects the credential from the api access fields of a receiver.
	pub fn from_receiver(conf: &ReceiverConfig, token_file: &Path) -> Result<Self, AuthError> {
		let credential = match conf.auth_method().ok_or(AuthError::NoMethod)? {
			AuthMethod::ServicePrincipal => Self::ServicePrincipal {
				tenant_id: conf.tenant_id.clone(),
				client_id: conf.client_id.clone(),
				client_secret: conf.client_secret.clone(),
			},
			AuthMethod::WorkloadIdentity => Self::WorkloadIdentity {
				tenant_id: conf.tenant_id.clone(),
				client_id: conf.client_id.clone(),
				token_file: token_file.to_owned(),
			},
			AuthMethod::ManagedIdentity => Self::ManagedIdentity { client_id: conf.client_id.clone() },
			AuthMethod::PersonalAccessToken => Self::PersonalAccessToken(conf.personal_access_token.clone()),
		};

		tracing::debug!(receiver = conf.name.as_str(), method = credential.method(), "selected authentication");

		Ok(credential)
	}

	pub fn method(&self) -> &'static str {
		match self {
			Self::ServicePrincipal { .. } => "service principal",
			Self::WorkloadIdentity { .. } => "workload identity",
			Self::ManagedIdentity { .. } => "managed identity",
			Self::PersonalAccessToken(_) => "personal access token",
		}
	}
}

#[serde_as]
#[derive(Deserialize)]
struct TokenResponse {
	access_token: String,
	/// the instance metadata service returns a string
	#[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
	expires_in: u64,
}

#[derive(Debug, Clone)]
struct AccessToken {
	header: String,
	renew_at: Instant,
}

/// Produces `Authorization` header values for a [Credential].
#[derive(Debug)]
pub struct Authorizer {
	credential: Credential,
	http: reqwest::Client,
	authority: Url,
	imds: Url,
	cached: Mutex<Option<AccessToken>>,
}

impl Authorizer {
	pub fn new(credential: Credential, http: reqwest::Client) -> Result<Self, AuthError> {
		Ok(Self::with_endpoints(credential, http, Url::parse(AUTHORITY)?, Url::parse(IMDS_ENDPOINT)?))
	}

	fn with_endpoints(credential: Credential, http: reqwest::Client, authority: Url, imds: Url) -> Self {
		Self { credential, http, authority, imds, cached: Mutex::new(None) }
	}

	/// the value of the `Authorization` header
	pub async fn header(&self) -> Result<String, AuthError> {
		if let Credential::PersonalAccessToken(pat) = &self.credential {
			return Ok(format!("Basic {}", base64::encode(format!(":{}", pat.expose()))));
		}

		let mut cached = self.cached.lock().await;

		if let Some(token) = cached.as_ref() {
			if token.renew_at > Instant::now() {
				return Ok(token.header.clone());
			}
		}

		let token = self.fetch().await?;
		let header = token.header.clone();
		*cached = Some(token);

		Ok(header)
	}

	/// requests a new token, retrying transient failures
	async fn fetch(&self) -> Result<AccessToken, AuthError> {
		let backoff = ExponentialBackoffBuilder::default()
			.with_initial_interval(Duration::from_millis(250))
			.with_max_interval(Duration::from_secs(5))
			.with_max_elapsed_time(Some(Duration::from_secs(30)))
			.build();

		let response = backoff::future::retry(backoff, || async move {
			self.request().await.map_err(|err| {
				if is_transient(&err) {
					tracing::warn!(method = self.credential.method(), "token request failed, retrying: {:?}", err);
					backoff::Error::transient(err)
				} else {
					backoff::Error::permanent(err)
				}
			})
		})
		.await?;

		tracing::debug!(
			method = self.credential.method(),
			expires_in = response.expires_in,
			"acquired access token"
		);

		let lifetime = Duration::from_secs(response.expires_in);

		Ok(AccessToken {
			header: format!("Bearer {}", response.access_token),
			renew_at: Instant::now() + lifetime.saturating_sub(EXPIRY_MARGIN),
		})
	}

	async fn request(&self) -> Result<TokenResponse, AuthError> {
		let request = match &self.credential {
			Credential::ServicePrincipal { tenant_id, client_id, client_secret } => self
				.http
				.post(self.token_endpoint(tenant_id)?)
				.form(&[
					("grant_type", "client_credentials"),
					("client_id", client_id.as_str()),
					("client_secret", client_secret.expose()),
					("scope", AZURE_DEVOPS_SCOPE),
				]),
			Credential::WorkloadIdentity { tenant_id, client_id, token_file } => {
				let assertion = tokio::fs::read_to_string(token_file)
					.await
					.map_err(|source| AuthError::TokenFile { path: token_file.clone(), source })?;

				self.http.post(self.token_endpoint(tenant_id)?).form(&[
					("grant_type", "client_credentials"),
					("client_id", client_id.as_str()),
					("client_assertion_type", CLIENT_ASSERTION_TYPE),
					("client_assertion", assertion.trim()),
					("scope", AZURE_DEVOPS_SCOPE),
				])
			}
			Credential::ManagedIdentity { client_id } => {
				self.http.get(self.imds.clone()).header("Metadata", "true").query(&[
					("api-version", "2018-02-01"),
					("resource", AZURE_DEVOPS_RESOURCE),
					("client_id", client_id.as_str()),
				])
			}
			Credential::PersonalAccessToken(_) => return Err(AuthError::NoMethod),
		};

		let response = request.send().await?;
		let status = response.status();

		if !status.is_success() {
			let body = response.text().await.unwrap_or_default();
			return Err(AuthError::Status { status, body });
		}

		Ok(response.json().await?)
	}

	fn token_endpoint(&self, tenant_id: &str) -> Result<Url, AuthError> {
		Ok(self.authority.join(&format!("{tenant_id}/oauth2/v2.0/token"))?)
	}
}

fn is_transient(err: &AuthError) -> bool {
	match err {
		AuthError::Request(err) => err.is_timeout() || err.is_connect(),
		AuthError::Status { status, .. } => {
			status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
		}
		_ => false,
	}
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use serde_json::json;
	use wiremock::{
		matchers::{body_string_contains, header, method, path, query_param},
		Mock, MockServer, ResponseTemplate,
	};

	use super::*;

	fn receiver(fields: &[(&str, &str)]) -> ReceiverConfig {
		let mut conf = ReceiverConfig { name: "azdo".to_owned(), ..Default::default() };
		for (key, value) in fields {
			match *key {
				"tenant_id" => conf.tenant_id = value.to_string(),
				"client_id" => conf.client_id = value.to_string(),
				"client_secret" => conf.client_secret = Secret::new(*value),
				"subscription_id" => conf.subscription_id = value.to_string(),
				"personal_access_token" => conf.personal_access_token = Secret::new(*value),
				_ => unreachable!(),
			}
		}
		conf
	}

	fn authorizer(server: &MockServer, credential: Credential) -> Authorizer {
		let base = Url::parse(&format!("{}/", server.uri())).unwrap();
		Authorizer::with_endpoints(credential, reqwest::Client::new(), base.clone(), base.join("imds").unwrap())
	}

	#[test]
	fn credential_selection_follows_configured_fields() {
		let token_file = Path::new("/token");

		assert_eq!(
			Credential::from_receiver(
				&receiver(&[("tenant_id", "t"), ("client_id", "c"), ("client_secret", "s")]),
				token_file
			)
			.unwrap()
			.method(),
			"service principal"
		);
		assert_eq!(
			Credential::from_receiver(&receiver(&[("tenant_id", "t"), ("client_id", "c")]), token_file)
				.unwrap(),
			Credential::WorkloadIdentity {
				tenant_id: "t".to_owned(),
				client_id: "c".to_owned(),
				token_file: PathBuf::from("/token"),
			}
		);
		assert_eq!(
			Credential::from_receiver(&receiver(&[("client_id", "c"), ("subscription_id", "s")]), token_file)
				.unwrap(),
			Credential::ManagedIdentity { client_id: "c".to_owned() }
		);
		assert_eq!(
			Credential::from_receiver(&receiver(&[("personal_access_token", "pat")]), token_file)
				.unwrap()
				.method(),
			"personal access token"
		);
		assert!(matches!(
			Credential::from_receiver(
				&receiver(&[("client_id", "c"), ("personal_access_token", "pat")]),
				token_file
			),
			Err(AuthError::NoMethod)
		));
		assert!(matches!(Credential::from_receiver(&receiver(&[]), token_file), Err(AuthError::NoMethod)));
	}

	#[tokio::test]
	async fn personal_access_token_is_basic_auth() {
		let authorizer =
			Authorizer::new(Credential::PersonalAccessToken(Secret::new("pat")), reqwest::Client::new()).unwrap();

		assert_eq!(authorizer.header().await.unwrap(), "Basic OnBhdA==");
	}

	#[tokio::test]
	async fn service_principal_token_is_cached() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/tenant/oauth2/v2.0/token"))
			.and(body_string_contains("grant_type=client_credentials"))
			.and(body_string_contains("client_secret=s3cr3t"))
			.respond_with(
				ResponseTemplate::new(200).set_body_json(json!({"access_token": "tok", "expires_in": 3599})),
			)
			.expect(1)
			.mount(&server)
			.await;

		let authorizer = authorizer(
			&server,
			Credential::ServicePrincipal {
				tenant_id: "tenant".to_owned(),
				client_id: "client".to_owned(),
				client_secret: Secret::new("s3cr3t"),
			},
		);

		assert_eq!(authorizer.header().await.unwrap(), "Bearer tok");
		assert_eq!(authorizer.header().await.unwrap(), "Bearer tok");
	}

	#[tokio::test]
	async fn workload_identity_sends_token_file_as_assertion() {
		let dir = tempfile::tempdir().unwrap();
		let token_file = dir.path().join("token");
		std::fs::File::create(&token_file).unwrap().write_all(b"sa-jwt\n").unwrap();

		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/tenant/oauth2/v2.0/token"))
			.and(body_string_contains("client_assertion=sa-jwt&"))
			.respond_with(
				ResponseTemplate::new(200).set_body_json(json!({"access_token": "wi", "expires_in": 3599})),
			)
			.expect(1)
			.mount(&server)
			.await;

		let authorizer = authorizer(
			&server,
			Credential::WorkloadIdentity {
				tenant_id: "tenant".to_owned(),
				client_id: "client".to_owned(),
				token_file,
			},
		);

		assert_eq!(authorizer.header().await.unwrap(), "Bearer wi");
	}

	#[tokio::test]
	async fn managed_identity_uses_metadata_service() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/imds"))
			.and(header("Metadata", "true"))
			.and(query_param("client_id", "client"))
			.and(query_param("resource", AZURE_DEVOPS_RESOURCE))
			.respond_with(
				ResponseTemplate::new(200).set_body_json(json!({"access_token": "mi", "expires_in": "3599"})),
			)
			.expect(1)
			.mount(&server)
			.await;

		let authorizer = authorizer(&server, Credential::ManagedIdentity { client_id: "client".to_owned() });

		assert_eq!(authorizer.header().await.unwrap(), "Bearer mi");
	}

	#[tokio::test]
	async fn server_errors_are_retried() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/imds"))
			.respond_with(ResponseTemplate::new(503))
			.up_to_n_times(1)
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/imds"))
			.respond_with(
				ResponseTemplate::new(200).set_body_json(json!({"access_token": "mi", "expires_in": 3599})),
			)
			.mount(&server)
			.await;

		let authorizer = authorizer(&server, Credential::ManagedIdentity { client_id: "client".to_owned() });

		assert_eq!(authorizer.header().await.unwrap(), "Bearer mi");
	}

	#[tokio::test]
	async fn client_errors_are_not_retried() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(401).set_body_string("invalid_client"))
			.expect(1)
			.mount(&server)
			.await;

		let authorizer = authorizer(
			&server,
			Credential::ServicePrincipal {
				tenant_id: "tenant".to_owned(),
				client_id: "client".to_owned(),
				client_secret: Secret::new("wrong"),
			},
		);

		match authorizer.header().await {
			Err(AuthError::Status { status, body }) => {
				assert_eq!(status, StatusCode::UNAUTHORIZED);
				assert_eq!(body, "invalid_client");
			}
			other => panic!("unexpected result {other:?}"),
		}
	}
}
