//! prometheus alertmanager receiver that tracks alert groups as azure devops
//! work items
//!
//! Features:
//! - creates a work item for every new alert group, tagged with the
//!   fingerprints of its alerts
//! - updates the work item while the group keeps firing and reopens it if it
//!   was auto resolved
//! - moves the work item into a configurable state once the group resolved
//! - per receiver tera templates for title, description, priority and custom
//!   fields

use std::sync::Arc;

use anyhow::{Context, Result};
use settings::Settings;

mod alert;
mod config;
mod log;
mod notify;
mod settings;
mod telemetry_endpoint;
mod template;
mod webhook;
mod workitem;

/// exit the complete program if one thread panics
fn setup_panic_handler() {
	let default_panic = std::panic::take_hook();
	std::panic::set_hook(Box::new(move |info| {
		default_panic(info);
		std::process::exit(1);
	}));
}

/// the entry point of the program
#[tokio::main]
pub async fn main() -> Result<()> {
	setup_panic_handler();

	log::setup_logging().context("could not setup logging")?;

	let settings = Settings::global();
	tracing::info!(
		version = clap::crate_version!(),
		config = %settings.config_path.display(),
		receivers = settings.config.receivers.len(),
		"starting alert-az-do"
	);

	let state = webhook::State::new(settings).context("failed to setup webhook receiver")?;

	webhook::run(Arc::new(state), settings.server.listen_address).await
}
