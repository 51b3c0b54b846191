//! Turns alertmanager notifications into work item changes.
//!
//! A [Receiver] handles one notification for one configured receiver. It
//! renders the project the work items live in and hands over to the
//! [reconciler::Reconciler], which decides whether a work item is created,
//! updated or resolved.

use std::fmt;

use thiserror::Error;

use self::{locks::GroupLocks, reconciler::Reconciler};
use crate::{
	alert::Data,
	config::ReceiverConfig,
	template::{RenderError, Renderer},
	workitem::{ClientError, WorkItemClient},
};

pub mod document;
pub mod locks;
pub mod reconciler;

/// text of the comment added to updated work items if `update_in_comment` is set
pub const UPDATE_COMMENT: &str = "Issue updated with new alert data";

/// step of the notification that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
	RenderProject,
	FindWorkItem,
	RenderWorkItemType,
	GenerateDocument,
	CreateWorkItem,
	UpdateWorkItem,
	GenerateResolveDocument,
	AddComment,
}

impl Stage {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::RenderProject => "generate project from template",
			Self::FindWorkItem => "find work item",
			Self::RenderWorkItemType => "render work item type",
			Self::GenerateDocument => "generate work item document",
			Self::CreateWorkItem => "create work item",
			Self::UpdateWorkItem => "update work item",
			Self::GenerateResolveDocument => "generate resolve document",
			Self::AddComment => "add comment to work item",
		}
	}
}

impl fmt::Display for Stage {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// call to the work item tracker that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
	QueryWorkItems,
	GetWorkItem,
	CreateWorkItem,
	UpdateWorkItem,
	CreateComment,
}

impl Operation {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::QueryWorkItems => "query work items",
			Self::GetWorkItem => "get work item",
			Self::CreateWorkItem => "create work item",
			Self::UpdateWorkItem => "update work item",
			Self::CreateComment => "create work item comment",
		}
	}
}

impl fmt::Display for Operation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Error aborting a notification
#[derive(Error, Debug)]
pub enum NotifyError {
	/// a template of the receiver failed to render
	#[error("{stage}: render {field}")]
	Render {
		stage: Stage,
		field: String,
		#[source]
		source: RenderError,
	},
	/// the work item tracker rejected a call or wasn't reachable
	#[error("{stage}: {operation}")]
	Remote {
		stage: Stage,
		operation: Operation,
		#[source]
		source: ClientError,
	},
}

impl NotifyError {
	pub fn stage(&self) -> Stage {
		match self {
			Self::Render { stage, .. } | Self::Remote { stage, .. } => *stage,
		}
	}
}

/// What a notification did to the work item tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
	Created(i64),
	Updated(i64),
	Resolved(i64),
	/// the matching work item is in the skip reopen state
	Skipped(i64),
	/// nothing firing and no work item to resolve
	NoMatch,
	/// nothing firing and auto resolve isn't configured
	Ignored,
}

impl fmt::Display for Outcome {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Created(id) => write!(f, "created work item {id}"),
			Self::Updated(id) => write!(f, "updated work item {id}"),
			Self::Resolved(id) => write!(f, "resolved work item {id}"),
			Self::Skipped(id) => write!(f, "skipped work item {id}"),
			Self::NoMatch => f.write_str("no matching work item"),
			Self::Ignored => f.write_str("ignored"),
		}
	}
}

/// Handles the notifications of one configured receiver.
pub struct Receiver<'a> {
	conf: &'a ReceiverConfig,
	renderer: &'a Renderer,
	client: &'a dyn WorkItemClient,
	locks: Option<&'a GroupLocks>,
}

impl<'a> Receiver<'a> {
	pub fn new(conf: &'a ReceiverConfig, renderer: &'a Renderer, client: &'a dyn WorkItemClient) -> Self {
		Self { conf, renderer, client, locks: None }
	}

	/// serialize notifications of the same alert group via `locks`
	pub fn with_locks(mut self, locks: &'a GroupLocks) -> Self {
		self.locks = Some(locks);
		self
	}

	#[tracing::instrument(skip_all, fields(receiver = self.conf.name.as_str(), group = data.group_key.as_str()))]
	pub async fn notify(&self, data: &Data) -> Result<Outcome, NotifyError> {
		let project = self.renderer.render(&self.conf.project, data).map_err(|source| NotifyError::Render {
			stage: Stage::RenderProject,
			field: "project".to_owned(),
			source,
		})?;

		let _guard = match self.locks {
			Some(locks) => Some(locks.lock(&project, &data.group_key).await),
			None => None,
		};

		Reconciler::new(self.conf, self.renderer, self.client, &project).reconcile(data).await
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use std::{collections::HashMap, sync::Mutex};

	use async_trait::async_trait;
	use reqwest::StatusCode;
	use serde_json::{json, Map, Value};

	use super::*;
	use crate::workitem::{PatchDocument, PatchOperation, WorkItem, WorkItemField};

	/// a call received by [RecordingClient]
	#[derive(Debug, Clone, PartialEq)]
	pub(crate) enum Call {
		Query(String),
		Get(i64),
		Create { project: String, work_item_type: String, document: PatchDocument },
		Update { project: Option<String>, id: i64, document: PatchDocument },
		Comment { project: String, id: i64, text: String },
	}

	/// in-memory work item tracker recording every call
	#[derive(Default)]
	pub(crate) struct RecordingClient {
		/// ids returned by every query
		pub matches: Vec<i64>,
		pub items: HashMap<i64, WorkItem>,
		/// calls of this operation fail
		pub fail: Option<Operation>,
		pub calls: Mutex<Vec<Call>>,
	}

	pub(crate) fn work_item(id: i64, state: &str, tags: &str) -> WorkItem {
		let fields = json!({
			"System.Title": "[firing] test",
			"System.State": state,
			"System.TeamProject": "Ops",
			"System.Tags": tags,
		});

		WorkItem { id, fields: serde_json::from_value(fields).unwrap() }
	}

	impl RecordingClient {
		pub(crate) fn with_item(item: WorkItem) -> Self {
			Self { matches: vec![item.id], items: HashMap::from([(item.id, item)]), ..Default::default() }
		}

		pub(crate) fn calls(&self) -> Vec<Call> {
			self.calls.lock().unwrap().clone()
		}

		pub(crate) fn creates(&self) -> Vec<Call> {
			self.calls().into_iter().filter(|call| matches!(call, Call::Create { .. })).collect()
		}

		pub(crate) fn updates(&self) -> Vec<Call> {
			self.calls().into_iter().filter(|call| matches!(call, Call::Update { .. })).collect()
		}

		fn record(&self, call: Call, operation: Operation) -> Result<(), ClientError> {
			self.calls.lock().unwrap().push(call);

			if self.fail == Some(operation) {
				return Err(ClientError::Status {
					status: StatusCode::INTERNAL_SERVER_ERROR,
					body: format!("{operation} failed"),
				});
			}
			Ok(())
		}

		/// the work item the document would produce
		fn apply(&self, id: i64, document: &[PatchOperation]) -> WorkItem {
			let mut fields = self.items.get(&id).map(|item| item.fields.clone()).unwrap_or_else(Map::new);
			for op in document {
				if let Some(name) = op.path.strip_prefix("/fields/") {
					fields.insert(name.to_owned(), Value::String(op.value.clone()));
				}
			}
			WorkItem { id, fields }
		}
	}

	#[async_trait]
	impl WorkItemClient for RecordingClient {
		async fn query(&self, wiql: &str) -> Result<Vec<i64>, ClientError> {
			self.record(Call::Query(wiql.to_owned()), Operation::QueryWorkItems)?;
			Ok(self.matches.clone())
		}

		async fn get(&self, id: i64) -> Result<WorkItem, ClientError> {
			self.record(Call::Get(id), Operation::GetWorkItem)?;
			Ok(self.items.get(&id).cloned().unwrap_or_else(|| work_item(id, "Active", "")))
		}

		async fn create(
			&self,
			project: &str,
			work_item_type: &str,
			document: &[PatchOperation],
		) -> Result<WorkItem, ClientError> {
			let call = Call::Create {
				project: project.to_owned(),
				work_item_type: work_item_type.to_owned(),
				document: document.to_vec(),
			};
			self.record(call, Operation::CreateWorkItem)?;
			Ok(self.apply(100, document))
		}

		async fn update(
			&self,
			project: Option<&str>,
			id: i64,
			document: &[PatchOperation],
		) -> Result<WorkItem, ClientError> {
			let call = Call::Update { project: project.map(str::to_owned), id, document: document.to_vec() };
			self.record(call, Operation::UpdateWorkItem)?;
			Ok(self.apply(id, document))
		}

		async fn comment(&self, project: &str, id: i64, text: &str) -> Result<(), ClientError> {
			let call = Call::Comment { project: project.to_owned(), id, text: text.to_owned() };
			self.record(call, Operation::CreateComment)
		}
	}

	#[test]
	fn errors_print_stage_and_detail() {
		let err = NotifyError::Remote {
			stage: Stage::FindWorkItem,
			operation: Operation::QueryWorkItems,
			source: ClientError::Status { status: StatusCode::BAD_GATEWAY, body: String::new() },
		};
		assert_eq!(err.to_string(), "find work item: query work items");
		assert_eq!(err.stage(), Stage::FindWorkItem);

		let err = NotifyError::Render {
			stage: Stage::GenerateDocument,
			field: "title".to_owned(),
			source: RenderError::Poisoned,
		};
		assert_eq!(err.to_string(), "generate work item document: render title");
	}

	#[test]
	fn recorded_item_reflects_document() {
		let client = RecordingClient::default();
		let item = client.apply(3, &[PatchOperation::replace(WorkItemField::State.field_path(), "Done")]);

		assert_eq!(item.state(), Some("Done"));
	}
}
