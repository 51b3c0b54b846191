//! The narrow view of the remote work item tracker the reconciler works with.
//!
//! [WorkItemClient] is implemented by [azure::AzureDevOpsClient] against the
//! azure devops rest api and by an in-memory recorder in the tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use self::fields::{field_path_for, WorkItemField};

pub mod auth;
pub mod azure;
pub mod fields;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
/// json patch operation kind
pub enum Op {
	Add,
	Replace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// one field level instruction of a patch document
pub struct PatchOperation {
	pub op: Op,
	pub path: String,
	pub value: String,
}

impl PatchOperation {
	pub fn add(path: impl Into<String>, value: impl Into<String>) -> Self {
		Self { op: Op::Add, path: path.into(), value: value.into() }
	}

	pub fn replace(path: impl Into<String>, value: impl Into<String>) -> Self {
		Self { op: Op::Replace, path: path.into(), value: value.into() }
	}
}

/// ordered list of patch operations
pub type PatchDocument = Vec<PatchOperation>;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
/// a work item as returned by the tracker
pub struct WorkItem {
	pub id: i64,
	#[serde(default)]
	pub fields: Map<String, Value>,
}

impl WorkItem {
	/// string value of a field, [None] if the field is missing or not a string
	pub fn field(&self, field: WorkItemField) -> Option<&str> {
		self.fields.get(field.reference_name()).and_then(Value::as_str)
	}

	pub fn state(&self) -> Option<&str> {
		self.field(WorkItemField::State)
	}

	pub fn title(&self) -> &str {
		self.field(WorkItemField::Title).unwrap_or_default()
	}

	pub fn team_project(&self) -> Option<&str> {
		self.field(WorkItemField::TeamProject)
	}
}

/// Error returned by a [WorkItemClient] call
#[derive(Error, Debug)]
pub enum ClientError {
	/// the request couldn't be sent or the response couldn't be read
	#[error("request failed")]
	Http(#[from] reqwest::Error),
	/// the tracker answered with a non success status code
	#[error("unexpected response status {status}: {body}")]
	Status { status: reqwest::StatusCode, body: String },
	/// the response body didn't have the expected shape
	#[error("failed to decode response")]
	Decode(#[from] serde_json::Error),
	/// no access token could be acquired
	#[error("failed to acquire credentials")]
	Auth(#[from] auth::AuthError),
	#[error("base url {0} can't be used for api requests")]
	BaseUrl(url::Url),
}

/// The five operations the reconciler needs from the tracker.
#[async_trait]
pub trait WorkItemClient: Send + Sync {
	/// ids of the work items matching a wiql query
	async fn query(&self, wiql: &str) -> Result<Vec<i64>, ClientError>;

	/// full representation of a work item
	async fn get(&self, id: i64) -> Result<WorkItem, ClientError>;

	async fn create(
		&self,
		project: &str,
		work_item_type: &str,
		document: &[PatchOperation],
	) -> Result<WorkItem, ClientError>;

	/// `project` may be omitted, the tracker resolves it from the id
	async fn update(
		&self,
		project: Option<&str>,
		id: i64,
		document: &[PatchOperation],
	) -> Result<WorkItem, ClientError>;

	async fn comment(&self, project: &str, id: i64, text: &str) -> Result<(), ClientError>;
}
