//! Matches a notification to its work item and creates, updates or resolves it.
//!
//! Work items are tagged with `Fingerprint:<fingerprint>` for every alert they
//! track. A notification matches the single work item of its project carrying
//! any of the notification's tags. The tracker is asked every time, nothing is
//! remembered between notifications.

use super::{
	document::{DocumentBuilder, FieldError},
	NotifyError, Operation, Outcome, Stage, UPDATE_COMMENT,
};
use crate::{
	alert::Data,
	config::{AutoResolve, ReceiverConfig},
	template::Renderer,
	workitem::{ClientError, PatchOperation, WorkItem, WorkItemClient, WorkItemField},
};

fn remote(stage: Stage, operation: Operation) -> impl FnOnce(ClientError) -> NotifyError {
	move |source| NotifyError::Remote { stage, operation, source }
}

fn render(stage: Stage) -> impl FnOnce(FieldError) -> NotifyError {
	move |FieldError { field, source }| NotifyError::Render { stage, field, source }
}

/// quotes a string literal for wiql
fn quote(value: &str) -> String {
	format!("'{}'", value.replace('\'', "''"))
}

/// Query for the work items of `project` tagged with any of `tags`.
pub fn search_query(project: &str, tags: &[String]) -> String {
	let predicates = tags
		.iter()
		.map(|tag| format!("[{}] CONTAINS {}", WorkItemField::Tags, quote(tag)))
		.collect::<Vec<_>>()
		.join(" OR ");

	format!(
		"SELECT [{}] FROM WorkItems WHERE [{}] = {} AND ({})",
		WorkItemField::Id,
		WorkItemField::TeamProject,
		quote(project),
		predicates
	)
}

pub struct Reconciler<'a> {
	conf: &'a ReceiverConfig,
	renderer: &'a Renderer,
	client: &'a dyn WorkItemClient,
	/// the rendered project
	project: &'a str,
}

impl<'a> Reconciler<'a> {
	pub fn new(
		conf: &'a ReceiverConfig,
		renderer: &'a Renderer,
		client: &'a dyn WorkItemClient,
		project: &'a str,
	) -> Self {
		Self { conf, renderer, client, project }
	}

	pub async fn reconcile(&self, data: &Data) -> Result<Outcome, NotifyError> {
		if data.has_firing() {
			match self.find_work_item(data).await? {
				Some(item) => {
					tracing::info!(id = item.id, "work item already exists for firing alert");
					self.update(data, item).await
				}
				None => self.create(data).await,
			}
		} else if let Some(auto_resolve) = &self.conf.auto_resolve {
			self.resolve(data, auto_resolve).await
		} else {
			tracing::debug!("no firing alerts and auto resolve is disabled");
			Ok(Outcome::Ignored)
		}
	}

	/// The work item tagged with any fingerprint of the notification, resolved
	/// alerts included. Several matching work items count as no match.
	async fn find_work_item(&self, data: &Data) -> Result<Option<WorkItem>, NotifyError> {
		let tags = data.fingerprint_tags();
		if tags.is_empty() {
			tracing::warn!("notification without alerts, no work item can match");
			return Ok(None);
		}

		let ids = self
			.client
			.query(&search_query(self.project, &tags))
			.await
			.map_err(remote(Stage::FindWorkItem, Operation::QueryWorkItems))?;

		match ids.as_slice() {
			[] => {
				tracing::debug!(fingerprints = ?tags, "no work items found");
				Ok(None)
			}
			[id] => {
				let item = self
					.client
					.get(*id)
					.await
					.map_err(remote(Stage::FindWorkItem, Operation::GetWorkItem))?;
				Ok(Some(item))
			}
			_ => {
				tracing::warn!(fingerprints = ?tags, ids = ?ids, "duplicate fingerprint on work items found, ignoring them");
				Ok(None)
			}
		}
	}

	async fn create(&self, data: &Data) -> Result<Outcome, NotifyError> {
		let work_item_type = self.renderer.render(&self.conf.issue_type, data).map_err(|source| {
			NotifyError::Render { stage: Stage::RenderWorkItemType, field: "issue_type".to_owned(), source }
		})?;

		let document = DocumentBuilder::new(self.conf, self.renderer)
			.build(data, true)
			.map_err(render(Stage::GenerateDocument))?;

		let item = self
			.client
			.create(self.project, &work_item_type, &document)
			.await
			.map_err(remote(Stage::CreateWorkItem, Operation::CreateWorkItem))?;

		tracing::info!(id = item.id, title = item.title(), "work item created");

		Ok(Outcome::Created(item.id))
	}

	async fn update(&self, data: &Data, item: WorkItem) -> Result<Outcome, NotifyError> {
		let state = item.state().unwrap_or_default();

		if !self.conf.skip_reopen_state.is_empty() && state == self.conf.skip_reopen_state {
			tracing::info!(id = item.id, state, "work item is in skip reopen state, not updating");
			return Ok(Outcome::Skipped(item.id));
		}

		let mut document = DocumentBuilder::new(self.conf, self.renderer)
			.build(data, false)
			.map_err(render(Stage::GenerateDocument))?;

		// the tags of every alert ever seen for the group, resolved ones included
		if !data.alerts.is_empty() {
			document.push(PatchOperation::replace(
				WorkItemField::Tags.field_path(),
				data.fingerprint_tags().join("; "),
			));
		}

		if matches!(&self.conf.auto_resolve, Some(auto_resolve) if auto_resolve.state == state) {
			tracing::info!(id = item.id, state, reopen_state = self.conf.reopen_state.as_str(), "reopening work item");
			document.push(PatchOperation::replace(WorkItemField::State.field_path(), &self.conf.reopen_state));
		}

		let updated = self
			.client
			.update(Some(self.project), item.id, &document)
			.await
			.map_err(remote(Stage::UpdateWorkItem, Operation::UpdateWorkItem))?;

		tracing::info!(id = updated.id, title = updated.title(), "work item updated");

		if self.conf.update_in_comment() {
			self.add_comment(&item).await?;
		}

		Ok(Outcome::Updated(updated.id))
	}

	async fn resolve(&self, data: &Data, auto_resolve: &AutoResolve) -> Result<Outcome, NotifyError> {
		let item = match self.find_work_item(data).await? {
			Some(item) => item,
			None => {
				tracing::info!("no work item found to resolve");
				return Ok(Outcome::NoMatch);
			}
		};

		let mut document = DocumentBuilder::new(self.conf, self.renderer)
			.build(data, false)
			.map_err(render(Stage::GenerateResolveDocument))?;

		document.push(PatchOperation::replace(WorkItemField::State.field_path(), &auto_resolve.state));

		let resolved = self
			.client
			.update(None, item.id, &document)
			.await
			.map_err(remote(Stage::UpdateWorkItem, Operation::UpdateWorkItem))?;

		tracing::info!(id = resolved.id, title = resolved.title(), "work item resolved");

		Ok(Outcome::Resolved(resolved.id))
	}

	/// comments on the work item in the project it lives in
	async fn add_comment(&self, item: &WorkItem) -> Result<(), NotifyError> {
		let project = item.team_project().unwrap_or(self.project);

		self.client
			.comment(project, item.id, UPDATE_COMMENT)
			.await
			.map_err(remote(Stage::AddComment, Operation::CreateComment))?;

		tracing::info!(work_item = item.id, "work item comment created");

		Ok(())
	}
}
