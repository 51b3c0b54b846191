use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{
	filter::LevelFilter, fmt, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
	EnvFilter, Layer,
};

use crate::settings::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
	Plain,
	Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogSettings {
	#[serde(default = "default_level")]
	pub level: String,
	#[serde(default = "default_format")]
	pub format: LogFormat,
}

fn default_level() -> String {
	String::from("info")
}

fn default_format() -> LogFormat {
	LogFormat::Plain
}

impl Default for LogSettings {
	fn default() -> Self {
		Self { level: default_level(), format: default_format() }
	}
}

impl LogSettings {
	pub fn global() -> &'static Self {
		&Settings::global().log
	}
}

pub fn setup_logging() -> Result<()> {
	let settings = LogSettings::global();
	let level = tracing::Level::from_str(settings.level.as_str())
		.context(format!("invalid log level {}", settings.level))?;

	let fmt_layer = match settings.format {
		LogFormat::Plain => fmt::layer().boxed(),
		LogFormat::Json => fmt::layer().json().boxed(),
	};

	let filter_layer = EnvFilter::default()
		.add_directive(LevelFilter::from_level(level).into())
		.add_directive("hyper=warn".parse()?)
		.add_directive("reqwest=warn".parse()?)
		.add_directive("tera=warn".parse()?);

	let registry = tracing_subscriber::registry().with(filter_layer).with(fmt_layer);

	#[cfg(feature = "console")]
	let registry = registry.with(console_subscriber::spawn());

	registry.init();

	Ok(())
}
