//! The http server receiving alertmanager notifications.
//!
//! `POST /alert` takes a webhook payload and reconciles the work item of the
//! receiver it's addressed to. `/`, `/config`, `/healthz` and `/metrics` are
//! served for operators.

use std::{
	collections::HashMap,
	net::SocketAddr,
	path::Path,
	sync::{Arc, Mutex, PoisonError},
};

use anyhow::{Context, Result};
use axum::{
	extract::{rejection::JsonRejection, Extension, Json},
	http::StatusCode,
	response::{Html, IntoResponse, Response},
	routing::{get, post},
	Router,
};
use prometheus::IntCounterVec;
use serde::Serialize;

use crate::{
	alert::Data,
	config::{Config, ReceiverConfig},
	notify::{locks::GroupLocks, Receiver},
	settings::{ServerSettings, Settings},
	telemetry_endpoint,
	template::Renderer,
	workitem::{azure::AzureDevOpsClient, ClientError, WorkItemClient},
};

/// receiver label of requests that couldn't be assigned to a receiver
const UNKNOWN_RECEIVER: &str = "<unknown>";

/// builds the work item client of a receiver
type ClientFactory = Box<dyn Fn(&ReceiverConfig) -> Result<Arc<dyn WorkItemClient>, ClientError> + Send + Sync>;

pub struct State {
	config: Config,
	renderer: Renderer,
	locks: GroupLocks,
	/// clients by receiver name, kept to reuse connections and tokens
	clients: Mutex<HashMap<String, Arc<dyn WorkItemClient>>>,
	factory: ClientFactory,
	requests: IntCounterVec,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorBody {
	error: bool,
	status: u16,
	message: String,
}

impl State {
	pub fn new(settings: &Settings) -> Result<Self> {
		let config = settings.config.clone();

		let renderer = Renderer::new(Some(Path::new(&config.template)))
			.context(format!("error loading templates from {:?}", config.template))?;

		let server: ServerSettings = settings.server.clone();
		let factory: ClientFactory =
			Box::new(move |conf: &ReceiverConfig| -> Result<Arc<dyn WorkItemClient>, ClientError> {
				Ok(Arc::new(AzureDevOpsClient::from_receiver(conf, &server)?))
			});

		let requests = telemetry_endpoint::requests_counter().context("failed to register request metrics")?;

		Ok(Self::with_parts(config, renderer, factory, requests))
	}

	fn with_parts(config: Config, renderer: Renderer, factory: ClientFactory, requests: IntCounterVec) -> Self {
		Self {
			config,
			renderer,
			locks: GroupLocks::default(),
			clients: Mutex::new(HashMap::new()),
			factory,
			requests,
		}
	}

	fn client(&self, conf: &ReceiverConfig) -> Result<Arc<dyn WorkItemClient>, ClientError> {
		let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);

		if let Some(client) = clients.get(&conf.name) {
			return Ok(client.clone());
		}

		let client = (self.factory)(conf)?;
		clients.insert(conf.name.clone(), client.clone());

		Ok(client)
	}

	fn count(&self, receiver: &str, status: StatusCode) {
		self.requests.with_label_values(&[receiver, status.as_str()]).inc();
	}

	/// json error response, alertmanager logs the message
	fn error(&self, status: StatusCode, err: anyhow::Error, receiver: &str, data: Option<&Data>) -> Response {
		let message = format!("{:#}", err);

		tracing::error!(
			status_code = status.as_u16(),
			receiver,
			group_labels = ?data.map(|data| &data.group_labels),
			"error handling request: {}",
			message
		);
		self.count(receiver, status);

		(status, Json(ErrorBody { error: true, status: status.as_u16(), message })).into_response()
	}
}

async fn alert_handler(
	Extension(state): Extension<Arc<State>>,
	payload: Result<Json<Data>, JsonRejection>,
) -> Response {
	tracing::debug!("handling /alert webhook request");

	let data = match payload {
		Ok(Json(data)) => data,
		Err(err) => return state.error(StatusCode::BAD_REQUEST, err.into(), UNKNOWN_RECEIVER, None),
	};

	let conf = match state.config.receiver_by_name(&data.receiver) {
		Some(conf) => conf,
		None => {
			let err = anyhow::anyhow!("receiver missing: {}", data.receiver);
			return state.error(StatusCode::NOT_FOUND, err, UNKNOWN_RECEIVER, Some(&data));
		}
	};
	tracing::debug!(receiver = conf.name.as_str(), "matched receiver");

	let client = match state.client(conf) {
		Ok(client) => client,
		Err(err) => {
			let err = anyhow::Error::new(err).context("failed to create Azure DevOps client");
			return state.error(StatusCode::INTERNAL_SERVER_ERROR, err, &conf.name, Some(&data));
		}
	};

	let receiver = Receiver::new(conf, &state.renderer, client.as_ref()).with_locks(&state.locks);

	match receiver.notify(&data).await {
		Ok(outcome) => {
			tracing::debug!(receiver = conf.name.as_str(), %outcome, "notification handled");
			state.count(&conf.name, StatusCode::OK);
			StatusCode::OK.into_response()
		}
		// alertmanager shouldn't retry, the next notification of the group brings the same data
		Err(err) => {
			tracing::debug!(receiver = conf.name.as_str(), stage = %err.stage(), "notification failed");
			state.error(StatusCode::BAD_REQUEST, err.into(), &conf.name, Some(&data))
		}
	}
}

const PAGE_HEADER: &str = r#"<html>
<head>
<title>alert-az-do</title>
<style type="text/css">
body { margin: 0; font-family: "Helvetica Neue", Helvetica, Arial, sans-serif; font-size: 14px; color: #333; }
.navbar { display: flex; background-color: #222; margin: 0; }
.navbar > * { margin: 0; padding: 15px; }
.navbar a { text-decoration: none; color: #9d9d9d; }
body > * { margin: 15px; }
pre { padding: 10px; font-size: 13px; background-color: #f5f5f5; border: 1px solid #ccc; }
</style>
</head>
<body>
<div class="navbar">
<div><a href="/">alert-az-do</a></div>
<div><a href="/config">Configuration</a></div>
<div><a href="/metrics">Metrics</a></div>
</div>
"#;

const PAGE_FOOTER: &str = "</body>\n</html>\n";

fn page(content: &str) -> Html<String> {
	Html(format!("{PAGE_HEADER}{content}\n{PAGE_FOOTER}"))
}

async fn home_handler() -> Html<String> {
	page(
		r#"<p>This is alert-az-do, a <a href="https://prometheus.io/docs/alerting/latest/configuration/#webhook_config">webhook receiver</a>
for <a href="https://prometheus.io/docs/alerting/latest/alertmanager/">Prometheus Alertmanager</a>
tracking alert groups as Azure DevOps work items.</p>"#,
	)
}

async fn config_handler(Extension(state): Extension<Arc<State>>) -> Html<String> {
	page(&format!("<h2>Configuration</h2>\n<pre>{}</pre>", tera::escape_html(&state.config.to_yaml())))
}

async fn health_handler() -> &'static str {
	"OK"
}

pub fn router(state: Arc<State>) -> Router {
	Router::new()
		.route("/", get(home_handler))
		.route("/alert", post(alert_handler))
		.route("/config", get(config_handler))
		.route("/healthz", get(health_handler))
		.route("/metrics", get(telemetry_endpoint::metrics_handler))
		.layer(Extension(state))
}

pub async fn run(state: Arc<State>, addr: SocketAddr) -> Result<()> {
	tracing::info!(address = %addr, "listening");

	axum::Server::try_bind(&addr)
		.context(format!("failed to bind http server to {addr}"))?
		.serve(router(state).into_make_service())
		.await
		.context("http server crashed")?;

	Ok(())
}
