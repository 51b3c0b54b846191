//! The receiver configuration file.
//!
//! A configuration consists of a `defaults` section, a list of `receivers` and
//! the path of a template file. Receivers inherit everything they don't set
//! themselves from `defaults`, after loading every receiver is complete.

use std::{
	collections::BTreeMap,
	path::{Path, PathBuf},
	time::Duration,
};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::{log::LogSettings, settings::ServerSettings};

static ENV_VAR: Lazy<Regex> = Lazy::new(|| {
	#[allow(clippy::unwrap_used)]
	Regex::new(r"\$\(([a-zA-Z_0-9]+)\)").unwrap()
});

/// Error while loading or validating the configuration file
#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("failed to read config file {path:?}")]
	Read { path: PathBuf, source: std::io::Error },
	#[error("failed to parse config")]
	Parse(#[from] serde_yaml::Error),
	#[error("{0}")]
	Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
	ConfigError::Invalid(msg.into())
}

/// keys without a value (`key:`) are read as the empty value
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
	D: Deserializer<'de>,
	T: Default + Deserialize<'de>,
{
	Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A string which is never revealed when the configuration is displayed.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
	pub fn new(secret: impl Into<String>) -> Self {
		Self(secret.into())
	}

	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl std::fmt::Debug for Secret {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		if self.0.is_empty() {
			f.write_str("\"\"")
		} else {
			f.write_str("<secret>")
		}
	}
}

impl Serialize for Secret {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		if self.0.is_empty() {
			serializer.serialize_none()
		} else {
			serializer.serialize_str("<secret>")
		}
	}
}

/// Template source of a custom field. Plain yaml scalars are accepted and
/// turned into their string representation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FieldTemplate(String);

impl FieldTemplate {
	pub fn new(template: impl Into<String>) -> Self {
		Self(template.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl<'de> Deserialize<'de> for FieldTemplate {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		#[derive(Deserialize)]
		#[serde(untagged)]
		enum Scalar {
			String(String),
			Integer(i64),
			Float(f64),
			Bool(bool),
			Null,
		}

		Ok(Self(match Scalar::deserialize(deserializer)? {
			Scalar::String(s) => s,
			Scalar::Integer(i) => i.to_string(),
			Scalar::Float(f) => f.to_string(),
			Scalar::Bool(b) => b.to_string(),
			Scalar::Null => String::new(),
		}))
	}
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
/// state a work item is moved into once its alert group resolved
pub struct AutoResolve {
	#[serde(default, deserialize_with = "nullable")]
	pub state: String,
}

/// Configuration of a single receiver. Alertmanager addresses a receiver by
/// its `name`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReceiverConfig {
	#[serde(deserialize_with = "nullable")]
	pub name: String,

	// api access
	#[serde(deserialize_with = "nullable")]
	pub organization: String,
	#[serde(deserialize_with = "nullable")]
	pub tenant_id: String,
	#[serde(deserialize_with = "nullable")]
	pub client_id: String,
	#[serde(deserialize_with = "nullable")]
	pub subscription_id: String,
	#[serde(deserialize_with = "nullable")]
	pub client_secret: Secret,
	#[serde(deserialize_with = "nullable")]
	pub personal_access_token: Secret,

	// required work item fields
	#[serde(deserialize_with = "nullable")]
	pub project: String,
	#[serde(deserialize_with = "nullable")]
	pub other_projects: Vec<String>,
	#[serde(deserialize_with = "nullable")]
	pub issue_type: String,
	#[serde(deserialize_with = "nullable")]
	pub summary: String,
	#[serde(deserialize_with = "nullable")]
	pub reopen_state: String,
	#[serde(with = "humantime_serde")]
	pub reopen_duration: Option<Duration>,

	// optional work item fields
	#[serde(deserialize_with = "nullable")]
	pub priority: String,
	#[serde(deserialize_with = "nullable")]
	pub description: String,
	#[serde(deserialize_with = "nullable")]
	pub skip_reopen_state: String,
	#[serde(deserialize_with = "nullable")]
	pub fields: BTreeMap<String, FieldTemplate>,
	#[serde(deserialize_with = "nullable")]
	pub components: Vec<String>,
	#[serde(deserialize_with = "nullable")]
	pub static_labels: Vec<String>,

	pub add_group_labels: Option<bool>,
	pub update_in_comment: Option<bool>,
	pub auto_resolve: Option<AutoResolve>,
}

/// The authentication methods a receiver can be configured with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
	ServicePrincipal,
	WorkloadIdentity,
	ManagedIdentity,
	PersonalAccessToken,
}

impl ReceiverConfig {
	fn has_service_principal(&self) -> bool {
		!self.tenant_id.is_empty() && !self.client_id.is_empty() && !self.client_secret.is_empty()
	}

	fn has_managed_identity(&self) -> bool {
		!self.client_id.is_empty() && !self.subscription_id.is_empty()
	}

	/// number of complete, mutually exclusive authentication methods
	fn auth_method_count(&self) -> usize {
		let service_principal = self.has_service_principal();
		let managed_identity = self.has_managed_identity() && !service_principal;
		let pat = !self.personal_access_token.is_empty();

		[service_principal, managed_identity, pat].into_iter().filter(|m| *m).count()
	}

	/// The authentication method selected by the api access fields. Each
	/// method requires its fields and forbids all others.
	pub fn auth_method(&self) -> Option<AuthMethod> {
		let tenant = !self.tenant_id.is_empty();
		let client = !self.client_id.is_empty();
		let secret = !self.client_secret.is_empty();
		let subscription = !self.subscription_id.is_empty();
		let pat = !self.personal_access_token.is_empty();

		match (tenant, client, secret, subscription, pat) {
			(true, true, true, false, false) => Some(AuthMethod::ServicePrincipal),
			(true, true, false, false, false) => Some(AuthMethod::WorkloadIdentity),
			(false, true, false, true, false) => Some(AuthMethod::ManagedIdentity),
			(false, false, false, false, true) => Some(AuthMethod::PersonalAccessToken),
			_ => None,
		}
	}

	pub fn update_in_comment(&self) -> bool {
		self.update_in_comment.unwrap_or(false)
	}

	/// fills every unset field from `defaults`
	fn inherit(&mut self, defaults: &ReceiverConfig) -> Result<(), ConfigError> {
		fn required(
			value: &mut String,
			default: &str,
			field: &str,
			receiver: &str,
		) -> Result<(), ConfigError> {
			if value.is_empty() {
				if default.is_empty() {
					return Err(invalid(format!("missing {field} in receiver {receiver:?}")));
				}
				*value = default.to_owned();
			}
			Ok(())
		}

		fn optional(value: &mut String, default: &str) {
			if value.is_empty() && !default.is_empty() {
				*value = default.to_owned();
			}
		}

		let name = self.name.clone();

		required(&mut self.organization, &defaults.organization, "organization", &name)?;
		url::Url::parse(&format!("https://dev.azure.com/{}", self.organization)).map_err(|err| {
			invalid(format!("invalid organization {:?} in receiver {name:?}: {err}", self.organization))
		})?;

		if self.auth_method_count() > 1 {
			return Err(invalid(format!(
				"bad auth config in receiver {name:?}: Service Principal (TenantID+ClientID+ClientSecret), \
				 Managed Identity (ClientID+SubscriptionID), and PAT authentication are mutually exclusive"
			)));
		}

		let complete = !self.personal_access_token.is_empty()
			|| self.has_service_principal()
			|| self.has_managed_identity();
		if !complete {
			if !defaults.personal_access_token.is_empty() {
				self.personal_access_token = defaults.personal_access_token.clone();
			} else if defaults.has_service_principal() {
				optional(&mut self.tenant_id, &defaults.tenant_id);
				optional(&mut self.client_id, &defaults.client_id);
				if self.client_secret.is_empty() {
					self.client_secret = defaults.client_secret.clone();
				}
			} else if defaults.has_managed_identity() {
				optional(&mut self.client_id, &defaults.client_id);
				optional(&mut self.subscription_id, &defaults.subscription_id);
			} else if self.auth_method() != Some(AuthMethod::WorkloadIdentity) {
				return Err(invalid(format!("missing authentication in receiver {name:?}")));
			}
		}

		required(&mut self.project, &defaults.project, "project", &name)?;
		required(&mut self.issue_type, &defaults.issue_type, "issue_type", &name)?;
		required(&mut self.summary, &defaults.summary, "summary", &name)?;
		required(&mut self.reopen_state, &defaults.reopen_state, "reopen_state", &name)?;
		if self.reopen_duration.is_none() {
			if defaults.reopen_duration.is_none() {
				return Err(invalid(format!("missing reopen_duration in receiver {name:?}")));
			}
			self.reopen_duration = defaults.reopen_duration;
		}

		optional(&mut self.priority, &defaults.priority);
		optional(&mut self.description, &defaults.description);
		optional(&mut self.skip_reopen_state, &defaults.skip_reopen_state);

		if matches!(&self.auto_resolve, Some(auto_resolve) if auto_resolve.state.is_empty()) {
			return Err(invalid(format!(
				"bad config in receiver {name:?}, 'auto_resolve' was defined with empty 'state' field"
			)));
		}
		if self.auto_resolve.is_none() {
			self.auto_resolve = defaults.auto_resolve.clone();
		}

		for (key, value) in defaults.fields.iter() {
			self.fields.entry(key.clone()).or_insert_with(|| value.clone());
		}
		self.static_labels.extend(defaults.static_labels.iter().cloned());
		self.other_projects.extend(defaults.other_projects.iter().cloned());

		if self.add_group_labels.is_none() {
			self.add_group_labels = defaults.add_group_labels;
		}
		if self.update_in_comment.is_none() {
			self.update_in_comment = defaults.update_in_comment;
		}

		Ok(())
	}
}

/// top level structure of the configuration file
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
	#[serde(default)]
	pub defaults: ReceiverConfig,
	#[serde(default)]
	pub receivers: Vec<ReceiverConfig>,
	#[serde(default)]
	pub template: String,
	#[serde(default)]
	pub server: ServerSettings,
	#[serde(default)]
	pub log: LogSettings,
}

impl Config {
	/// Parses and validates a configuration. Relative paths stay untouched.
	pub fn load(content: &str) -> Result<Self, ConfigError> {
		let mut config: Config = serde_yaml::from_str(content)?;
		config.resolve()?;
		Ok(config)
	}

	/// Reads a configuration file, substitutes `$(VAR)` environment references
	/// and resolves the template path relative to the file.
	pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
		tracing::info!(path = %path.display(), "loading configuration");

		let content = std::fs::read_to_string(path)
			.map_err(|source| ConfigError::Read { path: path.to_owned(), source })?;
		let content = substitute_env_vars(&content);

		let mut config = Self::load(&content)?;

		if let Some(base) = path.parent() {
			config.template = resolve_path(base, &config.template);
		}

		Ok(config)
	}

	fn resolve(&mut self) -> Result<(), ConfigError> {
		let defaults = &self.defaults;

		if defaults.auth_method_count() > 1 {
			return Err(invalid(
				"bad auth config in defaults section: Service Principal (TenantID+ClientID+ClientSecret), \
				 Managed Identity (ClientID+SubscriptionID), and PAT authentication are mutually exclusive",
			));
		}

		if matches!(&defaults.auto_resolve, Some(auto_resolve) if auto_resolve.state.is_empty()) {
			return Err(invalid("bad config in defaults section: state cannot be empty"));
		}

		for receiver in self.receivers.iter_mut() {
			if receiver.name.is_empty() {
				return Err(invalid("missing name for receiver"));
			}
			receiver.inherit(defaults)?;
		}

		if self.receivers.is_empty() {
			return Err(invalid("no receivers defined"));
		}

		if self.template.is_empty() {
			return Err(invalid("missing template file"));
		}

		Ok(())
	}

	/// the first receiver with the given name
	pub fn receiver_by_name(&self, name: &str) -> Option<&ReceiverConfig> {
		self.receivers.iter().find(|receiver| receiver.name == name)
	}

	/// the configuration as yaml with all secrets masked
	pub fn to_yaml(&self) -> String {
		serde_yaml::to_string(self)
			.unwrap_or_else(|err| format!("<error creating config string: {err}>"))
	}
}

/// Replaces `$(VAR)` with the value of the environment variable `VAR`.
/// Unset variables are replaced with an empty string.
pub fn substitute_env_vars(content: &str) -> String {
	ENV_VAR
		.replace_all(content, |caps: &Captures| match std::env::var(&caps[1]) {
			Ok(value) => value,
			Err(_) => {
				tracing::warn!(var = &caps[1], "missing environment variable, using empty value");
				String::new()
			}
		})
		.into_owned()
}

fn resolve_path(base: &Path, path: &str) -> String {
	if path.is_empty() || Path::new(path).is_absolute() {
		return path.to_owned();
	}

	let resolved = base.join(path);
	tracing::debug!(relative = path, absolute = %resolved.display(), "resolved relative configuration path");
	resolved.to_string_lossy().into_owned()
}
