use std::{
	net::{Ipv4Addr, SocketAddr},
	path::PathBuf,
	time::Duration,
};

use anyhow::{Context, Result};
use clap::{Arg, Command};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use url::Url;

use crate::{config::Config, log::LogSettings};

static SETTINGS: OnceCell<Settings> = OnceCell::new();

/// prefix of environment variables overriding the `server` and `log` sections,
/// e.g. `ALERT_AZ_DO__LOG__LEVEL=debug`
const ENV_PREFIX: &str = "ALERT_AZ_DO";

/// settings of the http server and the azure devops client
#[serde_as]
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
	#[serde(default = "default_listen_address")]
	pub listen_address: SocketAddr,
	/// base url of the azure devops rest api
	#[serde(default = "default_base_url")]
	pub base_url: Url,
	#[serde_as(as = "DurationSecondsWithFrac<f64>")]
	#[serde(default = "default_request_timeout")]
	pub request_timeout: Duration,
	/// service account token used as client assertion for workload identity
	#[serde(default = "default_token_file")]
	pub token_file: PathBuf,
}

fn default_listen_address() -> SocketAddr {
	SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9097))
}

fn default_base_url() -> Url {
	#[allow(clippy::unwrap_used)]
	Url::parse("https://dev.azure.com").unwrap()
}

fn default_request_timeout() -> Duration {
	Duration::from_secs(30)
}

fn default_token_file() -> PathBuf {
	PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token")
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			listen_address: default_listen_address(),
			base_url: default_base_url(),
			request_timeout: default_request_timeout(),
			token_file: default_token_file(),
		}
	}
}

/// the parts of the settings which can be overridden by the environment and
/// the command line
#[derive(Debug, Clone, Deserialize, Serialize)]
struct Overridable {
	server: ServerSettings,
	log: LogSettings,
}

#[derive(Debug, Clone)]
pub struct Settings {
	pub config_path: PathBuf,
	pub config: Config,
	pub server: ServerSettings,
	pub log: LogSettings,
}

impl Settings {
	pub fn global() -> &'static Self {
		SETTINGS.get_or_init(|| {
			match Self::load().context("failed to load config and command line arguments") {
				Ok(settings) => settings,
				Err(err) => {
					// tracing wasn't setup yet
					panic!("{:#?}", err);
				}
			}
		})
	}

	fn load() -> Result<Self> {
		let opts = Command::new(clap::crate_name!())
			.version(clap::crate_version!())
			.about(clap::crate_description!())
			.author(clap::crate_authors!())
			.args(&[
				Arg::new("config")
					.help("path of config file")
					.takes_value(true)
					.short('c')
					.long("config")
					.default_value("config/alert-az-do.yml"),
				Arg::new("listen-address")
					.help("address to listen on for http requests")
					.takes_value(true)
					.long("listen-address"),
				Arg::new("log.level")
					.help("log level")
					.possible_values(["error", "warn", "info", "debug", "trace"])
					.ignore_case(true)
					.takes_value(true)
					.long("log.level"),
				Arg::new("log.format")
					.help("log format")
					.possible_values(["plain", "json"])
					.takes_value(true)
					.long("log.format"),
			])
			.get_matches();

		let config_path = PathBuf::from(opts.value_of("config").context("missing config path")?);

		let port = std::env::var("PORT").ok().map(|port| format!("0.0.0.0:{port}"));

		Self::from_parts(
			config_path,
			[
				("server.listen_address", port.as_deref()),
				("server.listen_address", opts.value_of("listen-address")),
				("log.level", opts.value_of("log.level")),
				("log.format", opts.value_of("log.format")),
			],
		)
	}

	/// Loads the configuration file and layers the environment and the given
	/// overrides on top of its `server` and `log` sections. Later overrides win.
	fn from_parts<'a>(
		config_path: PathBuf,
		overrides: impl IntoIterator<Item = (&'static str, Option<&'a str>)>,
	) -> Result<Self> {
		let config = Config::load_file(&config_path).context("can't load config")?;

		let file = config::Config::try_from(&Overridable {
			server: config.server.clone(),
			log: config.log.clone(),
		})
		.context("can't convert config")?;

		let mut builder = config::Config::builder()
			.add_source(file)
			.add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"));

		for (key, value) in overrides {
			builder = builder.set_override_option(key, value).context("invalid override")?;
		}

		let Overridable { server, log } = builder
			.build()
			.context("can't load settings")?
			.try_deserialize()
			.context("can't load settings")?;

		Ok(Self { config_path, config, server, log })
	}
}
