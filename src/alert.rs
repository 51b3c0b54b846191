//! data structures for deserializing incoming alertmanager notifications
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// prefix of the work item tags that link a work item to an alert instance
pub const FINGERPRINT_TAG_PREFIX: &str = "Fingerprint:";

/// label which is always sorted first by [KV::sorted_pairs]
pub const ALERT_NAME_LABEL: &str = "alertname";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
/// status of a single alert or of a whole alert group
pub enum AlertStatus {
	/// alert is currently active
	Firing,
	/// alert stopped firing
	Resolved,
}

impl AlertStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			AlertStatus::Firing => "firing",
			AlertStatus::Resolved => "resolved",
		}
	}
}

impl std::fmt::Display for AlertStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// a single label or annotation
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Pair {
	pub name: String,
	pub value: String,
}

/// label or annotation set of an alert
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct KV(BTreeMap<String, String>);

impl KV {
	/// pairs sorted by name, [ALERT_NAME_LABEL] always comes first. Empty
	/// values count as absent.
	pub fn sorted_pairs(&self) -> Vec<Pair> {
		let alertname = self
			.0
			.get_key_value(ALERT_NAME_LABEL)
			.filter(|(_, value)| !value.is_empty())
			.map(|(name, value)| Pair { name: name.clone(), value: value.clone() });

		alertname
			.into_iter()
			.chain(
				self.0
					.iter()
					.filter(|(name, value)| name.as_str() != ALERT_NAME_LABEL && !value.is_empty())
					.map(|(name, value)| Pair { name: name.clone(), value: value.clone() }),
			)
			.collect()
	}

	pub fn names(&self) -> Vec<String> {
		self.sorted_pairs().into_iter().map(|pair| pair.name).collect()
	}

	pub fn values(&self) -> Vec<String> {
		self.sorted_pairs().into_iter().map(|pair| pair.value).collect()
	}

	/// copy of the set without the given keys
	pub fn remove(&self, keys: &[&str]) -> Self {
		Self(
			self.0
				.iter()
				.filter(|(name, _)| !keys.contains(&name.as_str()))
				.map(|(name, value)| (name.clone(), value.clone()))
				.collect(),
		)
	}
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for KV {
	fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
		Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
	}
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
/// a single alert of a notification
pub struct Alert {
	pub status: AlertStatus,
	#[serde(default)]
	pub labels: KV,
	#[serde(default)]
	pub annotations: KV,
	pub starts_at: DateTime<Utc>,
	pub ends_at: DateTime<Utc>,
	#[serde(default, rename = "generatorURL")]
	pub generator_url: String,
	pub fingerprint: String,
}

impl Alert {
	pub fn is_firing(&self) -> bool {
		self.status == AlertStatus::Firing
	}

	/// tag which links a work item to this alert
	pub fn fingerprint_tag(&self) -> String {
		format!("{FINGERPRINT_TAG_PREFIX}{}", self.fingerprint)
	}
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
/// data from prometheus received by the alertmanager webhook receiver
pub struct Data {
	#[serde(default)]
	pub version: String,
	#[serde(default)]
	pub group_key: String,
	#[serde(default)]
	pub truncated_alerts: u64,
	pub receiver: String,
	pub status: AlertStatus,
	#[serde(default)]
	pub alerts: Vec<Alert>,
	#[serde(default)]
	pub group_labels: KV,
	#[serde(default)]
	pub common_labels: KV,
	#[serde(default)]
	pub common_annotations: KV,
	#[serde(default, rename = "externalURL")]
	pub external_url: String,
}

impl Data {
	/// firing alerts in notification order
	pub fn firing(&self) -> impl Iterator<Item = &Alert> + Clone {
		self.alerts.iter().filter(|alert| alert.is_firing())
	}

	/// resolved alerts in notification order
	pub fn resolved(&self) -> impl Iterator<Item = &Alert> + Clone {
		self.alerts.iter().filter(|alert| !alert.is_firing())
	}

	pub fn has_firing(&self) -> bool {
		self.firing().next().is_some()
	}

	/// fingerprint tags of all alerts, regardless of their status
	pub fn fingerprint_tags(&self) -> Vec<String> {
		self.alerts.iter().map(Alert::fingerprint_tag).collect()
	}

	pub fn firing_fingerprint_tags(&self) -> Vec<String> {
		self.firing().map(Alert::fingerprint_tag).collect()
	}

	pub fn resolved_fingerprint_tags(&self) -> Vec<String> {
		self.resolved().map(Alert::fingerprint_tag).collect()
	}
}
