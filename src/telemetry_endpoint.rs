//! Here we expose prometheus metrics about alert-az-do
use axum::{
	http::{header::CONTENT_TYPE, StatusCode},
	response::{IntoResponse, Response},
};
use prometheus::{Encoder, IntCounterVec, TextEncoder};

/// counter of handled webhook requests by receiver and response code
pub fn requests_counter() -> prometheus::Result<IntCounterVec> {
	use prometheus::{opts, register_int_counter_vec};

	register_int_counter_vec!(
		opts!("requests_total", "requests processed, by receiver and status code").namespace("alert_az_do"),
		&["receiver", "code"]
	)
}

pub async fn metrics_handler() -> Response {
	let mut buffer = vec![];
	let encoder = TextEncoder::new();
	let metric_families = prometheus::gather();

	if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
		tracing::error!("failed to encode metrics: {:?}", err);
		return StatusCode::INTERNAL_SERVER_ERROR.into_response();
	}

	([(CONTENT_TYPE, encoder.format_type().to_owned())], buffer).into_response()
}
