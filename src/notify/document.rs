//! Builds the patch document of a work item from a notification.

use crate::{
	alert::Data,
	config::ReceiverConfig,
	template::{RenderError, Renderer},
	workitem::{field_path_for, PatchDocument, PatchOperation, WorkItemField},
};

/// maximum length of a work item title
pub const MAX_TITLE_LENGTH: usize = 128;

/// A template of the document failed to render
#[derive(Debug)]
pub struct FieldError {
	/// `title`, `description`, `priority` or `field <name>`
	pub field: String,
	pub source: RenderError,
}

pub struct DocumentBuilder<'a> {
	conf: &'a ReceiverConfig,
	renderer: &'a Renderer,
}

impl<'a> DocumentBuilder<'a> {
	pub fn new(conf: &'a ReceiverConfig, renderer: &'a Renderer) -> Self {
		Self { conf, renderer }
	}

	fn render(&self, field: impl Into<String>, template: &str, data: &Data) -> Result<String, FieldError> {
		self.renderer
			.render(template, data)
			.map_err(|source| FieldError { field: field.into(), source })
	}

	/// Renders title, description, priority and the custom fields. The tags
	/// of the firing alerts are added if `add_fingerprint` is set.
	pub fn build(&self, data: &Data, add_fingerprint: bool) -> Result<PatchDocument, FieldError> {
		let mut document = PatchDocument::new();

		let mut title = self.render("title", &self.conf.summary, data)?;
		if title.chars().count() > MAX_TITLE_LENGTH {
			title = title.chars().take(MAX_TITLE_LENGTH).collect();
			tracing::warn!(receiver = self.conf.name.as_str(), "title truncated to {} characters", MAX_TITLE_LENGTH);
		}
		document.push(PatchOperation::add(WorkItemField::Title.field_path(), title));

		let description = self.render("description", &self.conf.description, data)?;
		document.push(PatchOperation::add(WorkItemField::Description.field_path(), description));

		if add_fingerprint && !data.alerts.is_empty() {
			document.push(PatchOperation::add(
				WorkItemField::Tags.field_path(),
				data.firing_fingerprint_tags().join("; "),
			));
		}

		if !self.conf.priority.is_empty() {
			let priority = self.render("priority", &self.conf.priority, data)?;
			document.push(PatchOperation::add(WorkItemField::Priority.field_path(), priority));
		}

		for (name, template) in self.conf.fields.iter() {
			let value = self.render(format!("field {name}"), template.as_str(), data)?;
			document.push(PatchOperation::add(field_path_for(name), value));
		}

		Ok(document)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		alert::{
			tests::{alert, data},
			AlertStatus,
		},
		config::FieldTemplate,
		workitem::Op,
	};

	fn conf() -> ReceiverConfig {
		ReceiverConfig {
			name: "azdo".to_owned(),
			summary: "[{{ status }}] test".to_owned(),
			description: "{{ commonAnnotations.description }}".to_owned(),
			..Default::default()
		}
	}

	fn build(conf: &ReceiverConfig, data: &Data, add_fingerprint: bool) -> Result<PatchDocument, FieldError> {
		let renderer = Renderer::new(None).unwrap();
		DocumentBuilder::new(conf, &renderer).build(data, add_fingerprint)
	}

	fn value<'d>(document: &'d PatchDocument, path: &str) -> Option<&'d str> {
		document.iter().find(|op| op.path == path).map(|op| op.value.as_str())
	}

	#[test]
	fn builds_title_description_and_firing_tags() {
		let data = data(vec![alert(AlertStatus::Firing, "f1"), alert(AlertStatus::Resolved, "f2")]);
		let document = build(&conf(), &data, true).unwrap();

		assert_eq!(
			document,
			vec![
				PatchOperation::add("/fields/System.Title", "[firing] test"),
				PatchOperation::add("/fields/System.Description", "Test alert description"),
				PatchOperation::add("/fields/System.Tags", "Fingerprint:f1"),
			]
		);
	}

	#[test]
	fn tags_are_omitted_without_fingerprint() {
		let data = data(vec![alert(AlertStatus::Firing, "f1")]);
		let document = build(&conf(), &data, false).unwrap();

		assert_eq!(value(&document, "/fields/System.Tags"), None);
		assert!(document.iter().all(|op| op.op == Op::Add));
	}

	#[test]
	fn multiple_firing_tags_are_joined() {
		let data = data(vec![
			alert(AlertStatus::Firing, "f1"),
			alert(AlertStatus::Resolved, "f2"),
			alert(AlertStatus::Firing, "f3"),
		]);
		let document = build(&conf(), &data, true).unwrap();

		assert_eq!(value(&document, "/fields/System.Tags"), Some("Fingerprint:f1; Fingerprint:f3"));
	}

	#[test]
	fn long_titles_are_truncated() {
		let mut conf = conf();
		conf.summary = "x".repeat(200);

		let document = build(&conf, &data(vec![alert(AlertStatus::Firing, "f1")]), true).unwrap();
		let title = value(&document, "/fields/System.Title").unwrap();

		assert_eq!(title.len(), MAX_TITLE_LENGTH);
		assert_eq!(title, &conf.summary[..MAX_TITLE_LENGTH]);
	}

	#[test]
	fn truncation_counts_characters() {
		let mut conf = conf();
		conf.summary = "ü".repeat(130);

		let document = build(&conf, &data(vec![alert(AlertStatus::Firing, "f1")]), true).unwrap();

		assert_eq!(value(&document, "/fields/System.Title").unwrap().chars().count(), MAX_TITLE_LENGTH);
	}

	#[test]
	fn priority_and_custom_fields() {
		let mut conf = conf();
		conf.priority = "{% if commonLabels.severity == \"critical\" %}1{% else %}3{% endif %}".to_owned();
		conf.fields.insert("System.AreaPath".to_owned(), FieldTemplate::new("Ops\\Alerts"));
		conf.fields.insert("/fields/Microsoft.VSTS.Common.Severity".to_owned(), FieldTemplate::new("1 - Critical"));
		conf.fields.insert("Custom.Team".to_owned(), FieldTemplate::new("{{ receiver }}"));
		conf.fields.insert(String::new(), FieldTemplate::new("empty"));

		let document = build(&conf, &data(vec![alert(AlertStatus::Firing, "f1")]), true).unwrap();

		assert_eq!(value(&document, "/fields/Microsoft.VSTS.Common.Priority"), Some("1"));
		assert_eq!(value(&document, "/fields/System.AreaPath"), Some("Ops\\Alerts"));
		assert_eq!(value(&document, "/fields/Microsoft.VSTS.Common.Severity"), Some("1 - Critical"));
		assert_eq!(value(&document, "/fields/Custom.Team"), Some("test"));
		assert_eq!(value(&document, "/fields/"), Some("empty"));
		assert_eq!(document.len(), 8);
	}

	#[test]
	fn render_failures_name_the_field() {
		let data = data(vec![alert(AlertStatus::Firing, "f1")]);

		let mut broken_title = conf();
		broken_title.summary = "{{ status ".to_owned();
		assert_eq!(build(&broken_title, &data, true).unwrap_err().field, "title");

		let mut broken_description = conf();
		broken_description.description = "{{ nope.nope }}".to_owned();
		assert_eq!(build(&broken_description, &data, true).unwrap_err().field, "description");

		let mut broken_priority = conf();
		broken_priority.priority = "{% if %}".to_owned();
		assert_eq!(build(&broken_priority, &data, true).unwrap_err().field, "priority");

		let mut broken_field = conf();
		broken_field.fields.insert("Custom.Team".to_owned(), FieldTemplate::new("{{ }}"));
		assert_eq!(build(&broken_field, &data, true).unwrap_err().field, "field Custom.Team");
	}
}
