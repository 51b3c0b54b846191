//! [WorkItemClient] for the azure devops rest api.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use prometheus::{HistogramVec, IntCounterVec};
use reqwest::{
	header::{AUTHORIZATION, CONTENT_TYPE},
	Method, RequestBuilder,
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;
use url::Url;

use super::{
	auth::{Authorizer, Credential},
	ClientError, PatchOperation, WorkItem, WorkItemClient,
};
use crate::{config::ReceiverConfig, settings::ServerSettings};

const API_VERSION: &str = "7.1";
const COMMENTS_API_VERSION: &str = "7.1-preview.4";
const JSON_PATCH: &str = "application/json-patch+json";

#[derive(Debug)]
/// prometheus meters of the requests sent to azure devops
struct Metrics {
	requests: IntCounterVec,
	requests_failed: IntCounterVec,
	request_duration: HistogramVec,
}

impl Metrics {
	fn new() -> Result<Self, prometheus::Error> {
		use prometheus::{exponential_buckets, histogram_opts, opts, register_histogram_vec, register_int_counter_vec};

		let requests = register_int_counter_vec!(
			opts!("http_requests_total", "total number of requests sent to azure devops")
				.namespace("alert_az_do")
				.subsystem("azure_devops"),
			&["operation"]
		)?;

		let requests_failed = register_int_counter_vec!(
			opts!("http_requests_failed", "number of azure devops requests without success status")
				.namespace("alert_az_do")
				.subsystem("azure_devops"),
			&["operation", "status_code"]
		)?;

		let request_duration = register_histogram_vec!(
			histogram_opts!(
				"http_request_duration_seconds",
				"total time of a azure devops request in seconds",
				exponential_buckets(0.01, 2., 12)?
			)
			.namespace("alert_az_do")
			.subsystem("azure_devops"),
			&["operation"]
		)?;

		Ok(Self { requests, requests_failed, request_duration })
	}
}

static METRICS: Lazy<Option<Metrics>> = Lazy::new(|| match Metrics::new() {
	Ok(metrics) => Some(metrics),
	Err(err) => {
		tracing::error!("failed to register azure devops metrics: {:?}", err);
		None
	}
});

#[derive(Deserialize)]
struct WorkItemReference {
	id: i64,
}

#[derive(Deserialize)]
struct WiqlResult {
	#[serde(rename = "workItems", default)]
	work_items: Vec<WorkItemReference>,
}

#[derive(Deserialize)]
struct Comment {
	id: i64,
}

/// Client of a single azure devops organization
#[derive(Debug)]
pub struct AzureDevOpsClient {
	http: reqwest::Client,
	base_url: Url,
	organization: String,
	authorizer: Authorizer,
}

impl AzureDevOpsClient {
	/// Builds a client for the organization and credential of a receiver.
	pub fn from_receiver(conf: &ReceiverConfig, settings: &ServerSettings) -> Result<Self, ClientError> {
		let http = reqwest::Client::builder().timeout(settings.request_timeout).build()?;
		let credential = Credential::from_receiver(conf, &settings.token_file)?;
		let authorizer = Authorizer::new(credential, http.clone())?;

		Self::new(http, settings.base_url.clone(), &conf.organization, authorizer)
	}

	pub fn new(
		http: reqwest::Client,
		base_url: Url,
		organization: &str,
		authorizer: Authorizer,
	) -> Result<Self, ClientError> {
		if base_url.cannot_be_a_base() {
			return Err(ClientError::BaseUrl(base_url));
		}

		Ok(Self { http, base_url, organization: organization.to_owned(), authorizer })
	}

	/// `{base_url}/{organization}[/{project}]/_apis/wit/{segments}`
	fn url(&self, project: Option<&str>, segments: &[&str], api_version: &str) -> Result<Url, ClientError> {
		let mut url = self.base_url.clone();

		url.path_segments_mut()
			.map_err(|_| ClientError::BaseUrl(self.base_url.clone()))?
			.pop_if_empty()
			.push(&self.organization)
			.extend(project)
			.extend(["_apis", "wit"])
			.extend(segments);

		url.query_pairs_mut().append_pair("api-version", api_version);

		Ok(url)
	}

	async fn send<T: DeserializeOwned>(
		&self,
		operation: &'static str,
		request: RequestBuilder,
	) -> Result<T, ClientError> {
		let metrics = METRICS.as_ref();

		if let Some(metrics) = metrics {
			metrics.requests.with_label_values(&[operation]).inc();
		}
		let _timer = metrics.map(|metrics| metrics.request_duration.with_label_values(&[operation]).start_timer());

		let response = request.header(AUTHORIZATION, self.authorizer.header().await?).send().await?;
		let status = response.status();

		if !status.is_success() {
			if let Some(metrics) = metrics {
				metrics.requests_failed.with_label_values(&[operation, status.as_str()]).inc();
			}

			let body = response.text().await.unwrap_or_default();
			tracing::debug!(operation, %status, body = body.as_str(), "azure devops request failed");

			return Err(ClientError::Status { status, body });
		}

		let body = response.bytes().await?;
		Ok(serde_json::from_slice(&body)?)
	}

	fn patch_request(&self, method: Method, url: Url, document: &[PatchOperation]) -> Result<RequestBuilder, ClientError> {
		Ok(self
			.http
			.request(method, url)
			.header(CONTENT_TYPE, JSON_PATCH)
			.body(serde_json::to_vec(document)?))
	}
}

#[async_trait]
impl WorkItemClient for AzureDevOpsClient {
	async fn query(&self, wiql: &str) -> Result<Vec<i64>, ClientError> {
		let url = self.url(None, &["wiql"], API_VERSION)?;

		let result: WiqlResult = self.send("wiql", self.http.post(url).json(&json!({ "query": wiql }))).await?;

		Ok(result.work_items.into_iter().map(|item| item.id).collect())
	}

	async fn get(&self, id: i64) -> Result<WorkItem, ClientError> {
		let url = self.url(None, &["workitems", &id.to_string()], API_VERSION)?;

		self.send("get", self.http.get(url)).await
	}

	async fn create(
		&self,
		project: &str,
		work_item_type: &str,
		document: &[PatchOperation],
	) -> Result<WorkItem, ClientError> {
		let url = self.url(Some(project), &["workitems", &format!("${work_item_type}")], API_VERSION)?;

		self.send("create", self.patch_request(Method::POST, url, document)?).await
	}

	async fn update(
		&self,
		project: Option<&str>,
		id: i64,
		document: &[PatchOperation],
	) -> Result<WorkItem, ClientError> {
		let url = self.url(project, &["workitems", &id.to_string()], API_VERSION)?;

		self.send("update", self.patch_request(Method::PATCH, url, document)?).await
	}

	async fn comment(&self, project: &str, id: i64, text: &str) -> Result<(), ClientError> {
		let mut url = self.url(Some(project), &["workItems", &id.to_string(), "comments"], COMMENTS_API_VERSION)?;
		url.query_pairs_mut().append_pair("format", "markdown");

		let comment: Comment = self.send("comment", self.http.post(url).json(&json!({ "text": text }))).await?;

		tracing::debug!(comment = comment.id, work_item = id, "created work item comment");

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use reqwest::StatusCode;
	use serde_json::json;
	use wiremock::{
		matchers::{body_json, header, method, path, query_param},
		Mock, MockServer, ResponseTemplate,
	};

	use super::*;
	use crate::{config::Secret, workitem::WorkItemField};

	async fn client(server: &MockServer) -> AzureDevOpsClient {
		let http = reqwest::Client::new();
		let authorizer = Authorizer::new(Credential::PersonalAccessToken(Secret::new("pat")), http.clone()).unwrap();

		AzureDevOpsClient::new(http, Url::parse(&server.uri()).unwrap(), "acme", authorizer).unwrap()
	}

	fn work_item(id: i64, state: &str) -> serde_json::Value {
		json!({
			"id": id,
			"rev": 1,
			"fields": {
				"System.Title": "[firing] test",
				"System.State": state,
				"System.TeamProject": "Ops",
				"System.Tags": "Fingerprint:f1"
			}
		})
	}

	#[tokio::test]
	async fn query_returns_matching_ids() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/acme/_apis/wit/wiql"))
			.and(query_param("api-version", "7.1"))
			.and(header("Authorization", "Basic OnBhdA=="))
			.and(body_json(json!({"query": "SELECT [System.Id] FROM WorkItems"})))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"queryType": "flat",
				"workItems": [{"id": 1, "url": "x"}, {"id": 7, "url": "y"}]
			})))
			.expect(1)
			.mount(&server)
			.await;

		let ids = client(&server).await.query("SELECT [System.Id] FROM WorkItems").await.unwrap();

		assert_eq!(ids, vec![1, 7]);
	}

	#[tokio::test]
	async fn get_fetches_the_full_item() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/acme/_apis/wit/workitems/42"))
			.respond_with(ResponseTemplate::new(200).set_body_json(work_item(42, "Active")))
			.mount(&server)
			.await;

		let item = client(&server).await.get(42).await.unwrap();

		assert_eq!(item.id, 42);
		assert_eq!(item.state(), Some("Active"));
		assert_eq!(item.field(WorkItemField::Tags), Some("Fingerprint:f1"));
	}

	#[tokio::test]
	async fn create_posts_a_json_patch_document() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/acme/Ops%20Team/_apis/wit/workitems/$Bug"))
			.and(header("Content-Type", JSON_PATCH))
			.and(body_json(json!([
				{"op": "add", "path": "/fields/System.Title", "value": "[firing] test"}
			])))
			.respond_with(ResponseTemplate::new(200).set_body_json(work_item(5, "New")))
			.expect(1)
			.mount(&server)
			.await;

		let document = vec![PatchOperation::add(WorkItemField::Title.field_path(), "[firing] test")];
		let item = client(&server).await.create("Ops Team", "Bug", &document).await.unwrap();

		assert_eq!(item.id, 5);
	}

	#[tokio::test]
	async fn update_with_and_without_project() {
		let server = MockServer::start().await;
		Mock::given(method("PATCH"))
			.and(path("/acme/Ops/_apis/wit/workitems/5"))
			.respond_with(ResponseTemplate::new(200).set_body_json(work_item(5, "Active")))
			.expect(1)
			.mount(&server)
			.await;
		Mock::given(method("PATCH"))
			.and(path("/acme/_apis/wit/workitems/5"))
			.respond_with(ResponseTemplate::new(200).set_body_json(work_item(5, "Done")))
			.expect(1)
			.mount(&server)
			.await;

		let client = client(&server).await;
		let document = vec![PatchOperation::replace(WorkItemField::State.field_path(), "Done")];

		assert_eq!(client.update(Some("Ops"), 5, &document).await.unwrap().state(), Some("Active"));
		assert_eq!(client.update(None, 5, &document).await.unwrap().state(), Some("Done"));
	}

	#[tokio::test]
	async fn comment_uses_markdown_preview_api() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/acme/Ops/_apis/wit/workItems/5/comments"))
			.and(query_param("api-version", COMMENTS_API_VERSION))
			.and(query_param("format", "markdown"))
			.and(body_json(json!({"text": "Issue updated with new alert data"})))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 99, "workItemId": 5})))
			.expect(1)
			.mount(&server)
			.await;

		client(&server).await.comment("Ops", 5, "Issue updated with new alert data").await.unwrap();
	}

	#[tokio::test]
	async fn error_status_is_returned_with_body() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.respond_with(ResponseTemplate::new(404).set_body_string("work item does not exist"))
			.mount(&server)
			.await;

		match client(&server).await.get(1).await {
			Err(ClientError::Status { status, body }) => {
				assert_eq!(status, StatusCode::NOT_FOUND);
				assert_eq!(body, "work item does not exist");
			}
			other => panic!("unexpected result {other:?}"),
		}
	}

	#[tokio::test]
	async fn malformed_response_is_a_decode_error() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.respond_with(ResponseTemplate::new(200).set_body_string("<html>sign in</html>"))
			.mount(&server)
			.await;

		assert!(matches!(client(&server).await.get(1).await, Err(ClientError::Decode(_))));
	}
}
