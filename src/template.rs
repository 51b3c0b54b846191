//! Renders the configured work item fields via tera templates.
//!
//! Every template is rendered against the received [Data]. Besides the
//! notification itself the context contains `firingAlerts` and
//! `resolvedAlerts`. The template file from the configuration is registered
//! under its file name so field templates can `include` it or `import` its
//! macros.
//!
//! Labels and annotations a notification doesn't carry render as empty
//! strings. Any other unknown variable is an error.

use std::{collections::HashMap, path::Path, sync::Mutex};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tera::{Tera, Value};
use thiserror::Error;

use crate::alert::{Alert, Data, KV};

static MISSING_VARIABLE: Lazy<Regex> = Lazy::new(|| {
	#[allow(clippy::unwrap_used)]
	Regex::new(r"Variable `([^`]+)` not found in context").unwrap()
});

/// context keys holding lists of alerts
const ALERT_LISTS: [&str; 3] = ["alerts", "firingAlerts", "resolvedAlerts"];

/// upper bound of missing labels filled in for a single render
const MAX_MISSING_KEYS: usize = 64;

/// Error occuring while rendering a template
#[derive(Error, Debug)]
pub enum RenderError {
	/// the notification couldn't be turned into a template context
	#[error("failed to build template context")]
	Context(#[source] tera::Error),
	/// the template is invalid or references something that doesn't exist
	#[error("failed to render template {template:?}")]
	Template {
		template: String,
		#[source]
		source: tera::Error,
	},
	#[error("template engine is unavailable after a panic")]
	Poisoned,
}

/// Template renderer shared between all requests
pub struct Renderer {
	tera: Mutex<Tera>,
}

impl Renderer {
	/// Returns a new renderer, registering the template file if there is one.
	pub fn new(template_file: Option<&Path>) -> Result<Self> {
		let mut tera = Tera::default();
		tera.autoescape_on(vec![]);

		tera.register_filter("sorted_names", sorted_names);
		tera.register_filter("sorted_values", sorted_values);
		tera.register_filter("remove", remove);
		tera.register_filter("re_replace_all", re_replace_all);
		tera.register_tester("matching", matching);

		if let Some(path) = template_file {
			let name = path
				.file_name()
				.and_then(|name| name.to_str())
				.context(format!("template path {:?} has no valid file name", path))?
				.to_owned();

			tera.add_template_file(path, Some(name.as_str()))
				.context(format!("could not load template file {:?}", path))?;

			tracing::info!(path = %path.display(), name = name.as_str(), "loaded template file");
		}

		Ok(Self { tera: Mutex::new(tera) })
	}

	/// Renders `template` against the notification. Strings without template
	/// syntax are returned unchanged.
	pub fn render(&self, template: &str, data: &Data) -> Result<String, RenderError> {
		if !template.contains("{{") && !template.contains("{%") {
			return Ok(template.to_owned());
		}

		let mut context = Self::context(data)?;
		let mut filled = 0;

		let mut tera = self.tera.lock().map_err(|_| RenderError::Poisoned)?;
		loop {
			let source = match tera.render_str(template, &tera_context(&context)?) {
				Ok(rendered) => return Ok(rendered),
				Err(source) => source,
			};

			match missing_variable(&source) {
				Some(path) if filled < MAX_MISSING_KEYS && fill_missing_key(&mut context, &path) => {
					tracing::trace!(path = path.as_str(), "rendering missing key as empty string");
					filled += 1;
				}
				_ => return Err(RenderError::Template { template: template.to_owned(), source }),
			}
		}
	}

	fn context(data: &Data) -> Result<Value, RenderError> {
		let mut context = serde_json::to_value(data).map_err(|err| RenderError::Context(err.into()))?;

		if let Some(map) = context.as_object_mut() {
			map.insert("firingAlerts".to_owned(), to_value(data.firing())?);
			map.insert("resolvedAlerts".to_owned(), to_value(data.resolved())?);
		}

		Ok(context)
	}
}

fn to_value<'a>(alerts: impl Iterator<Item = &'a Alert>) -> Result<Value, RenderError> {
	serde_json::to_value(alerts.collect::<Vec<_>>()).map_err(|err| RenderError::Context(err.into()))
}

fn tera_context(context: &Value) -> Result<tera::Context, RenderError> {
	tera::Context::from_value(context.clone()).map_err(RenderError::Context)
}

/// the variable path of a "not found" render error
fn missing_variable(err: &tera::Error) -> Option<String> {
	let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);

	while let Some(err) = current {
		if let Some(captures) = MISSING_VARIABLE.captures(&err.to_string()) {
			return Some(captures[1].to_owned());
		}
		current = err.source();
	}

	None
}

/// Inserts an empty value for the missing key of a label or annotation map
/// at `path`, e.g. `commonLabels.instance` or `alert.annotations.summary`
/// inside a loop. Returns false if `path` doesn't point into such a map.
fn fill_missing_key(context: &mut Value, path: &str) -> bool {
	let segments = path.split('.').collect::<Vec<_>>();
	let (key, parents) = match segments.split_last() {
		Some((key, parents)) if !parents.is_empty() => (*key, parents),
		_ => return false,
	};

	let map_name = parents[parents.len() - 1].to_lowercase();
	let kind = if map_name.ends_with("labels") {
		"labels"
	} else if map_name.ends_with("annotations") {
		"annotations"
	} else {
		return false;
	};

	if let Some(map) = lookup(context, parents) {
		return insert_empty(map, key);
	}

	// loop variables aren't part of the context, fill every alert instead
	let mut filled = false;
	for list in ALERT_LISTS {
		let alerts = context.get_mut(list).and_then(Value::as_array_mut);
		for alert in alerts.into_iter().flatten() {
			if let Some(map) = alert.get_mut(kind) {
				filled |= insert_empty(map, key);
			}
		}
	}

	filled
}

fn lookup<'v>(context: &'v mut Value, path: &[&str]) -> Option<&'v mut Value> {
	path.iter().try_fold(context, |value, segment| match value {
		Value::Object(map) => map.get_mut(*segment),
		Value::Array(list) => segment.parse::<usize>().ok().and_then(move |index| list.get_mut(index)),
		_ => None,
	})
}

fn insert_empty(map: &mut Value, key: &str) -> bool {
	match map {
		Value::Object(map) if !map.contains_key(key) => {
			map.insert(key.to_owned(), Value::String(String::new()));
			true
		}
		_ => false,
	}
}

fn as_kv(value: &Value, filter: &str) -> tera::Result<KV> {
	serde_json::from_value(value.clone()).map_err(|err| {
		tera::Error::msg(format!("filter `{filter}` expects a map of strings: {err}"))
	})
}

fn string_arg<'a>(args: &'a HashMap<String, Value>, name: &str, filter: &str) -> tera::Result<&'a str> {
	args.get(name)
		.and_then(Value::as_str)
		.ok_or_else(|| tera::Error::msg(format!("filter `{filter}` expects a string argument `{name}`")))
}

fn regex(pattern: &str) -> tera::Result<Regex> {
	Regex::new(pattern).map_err(|err| tera::Error::msg(format!("invalid regex {pattern:?}: {err}")))
}

/// label names, `alertname` first
fn sorted_names(value: &Value, _: &HashMap<String, Value>) -> tera::Result<Value> {
	Ok(as_kv(value, "sorted_names")?.names().into())
}

/// label values in the order of [sorted_names]
fn sorted_values(value: &Value, _: &HashMap<String, Value>) -> tera::Result<Value> {
	Ok(as_kv(value, "sorted_values")?.values().into())
}

/// `{{ commonLabels | remove(keys=["instance"]) | sorted_values }}`
fn remove(value: &Value, args: &HashMap<String, Value>) -> tera::Result<Value> {
	let keys = args
		.get("keys")
		.and_then(Value::as_array)
		.ok_or_else(|| tera::Error::msg("filter `remove` expects a list argument `keys`"))?
		.iter()
		.filter_map(Value::as_str)
		.collect::<Vec<_>>();

	tera::to_value(as_kv(value, "remove")?.remove(&keys))
		.map_err(|err| tera::Error::msg(format!("filter `remove` failed: {err}")))
}

/// `{{ value | re_replace_all(pattern="...", replacement="...") }}`
fn re_replace_all(value: &Value, args: &HashMap<String, Value>) -> tera::Result<Value> {
	let input = value
		.as_str()
		.ok_or_else(|| tera::Error::msg("filter `re_replace_all` expects a string"))?;
	let pattern = regex(string_arg(args, "pattern", "re_replace_all")?)?;
	let replacement = string_arg(args, "replacement", "re_replace_all")?;

	Ok(pattern.replace_all(input, replacement).into_owned().into())
}

/// `{% if value is matching("...") %}`
fn matching(value: Option<&Value>, args: &[Value]) -> tera::Result<bool> {
	let pattern = args
		.first()
		.and_then(Value::as_str)
		.ok_or_else(|| tera::Error::msg("tester `matching` expects a regex"))?;

	match value.and_then(Value::as_str) {
		Some(input) => Ok(regex(pattern)?.is_match(input)),
		None => Ok(false),
	}
}
