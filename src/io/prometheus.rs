//! Prometheus metrics HTTP endpoint
//!
//! Exposes cell metrics in Prometheus text format at /metrics.
//! Uses hyper for the HTTP server.

use crate::infra::metrics::{
    Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_FUSION_BOUNDS, METRICS_NUM_BUCKETS,
    METRICS_SOURCES,
};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with cell label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    cell: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{cell=\"{cell}\"}} {val}");
}

fn write_gauge_f64(output: &mut String, name: &str, help: &str, cell: &str, val: f64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} gauge");
    let _ = writeln!(output, "{name}{{cell=\"{cell}\"}} {val:.6}");
}

/// Write one metric family with a value per producer class
fn write_per_source(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    cell: &str,
    values: &[u64; 3],
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    for source in METRICS_SOURCES {
        let _ = writeln!(
            output,
            "{name}{{cell=\"{cell}\",source=\"{}\"}} {}",
            source.as_str(),
            values[source.index()]
        );
    }
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    cell: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{cell=\"{cell}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{cell=\"{cell}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{cell=\"{cell}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{cell=\"{cell}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, cell_id: &str) -> String {
    let summary = metrics.report(metrics.parts_in_progress());
    let mut output = String::with_capacity(8192);

    write_ingest_metrics(&mut output, cell_id, &summary);
    write_fusion_metrics(&mut output, cell_id, &summary);
    write_delivery_metrics(&mut output, cell_id, &summary);
    write_coordination_metrics(&mut output, cell_id, &summary);

    output
}

fn write_ingest_metrics(output: &mut String, cell: &str, summary: &MetricsSummary) {
    write_per_source(
        output,
        "cell_raw_events_total",
        "Raw events consumed per producer class",
        MetricType::Counter,
        cell,
        &summary.raw_by_source,
    );
    write_gauge_f64(
        output,
        "cell_raw_events_per_sec",
        "Raw events consumed per second",
        cell,
        summary.events_per_sec,
    );
    write_per_source(
        output,
        "cell_queue_dropped_total",
        "Raw events dropped on queue overflow",
        MetricType::Counter,
        cell,
        &summary.dropped_by_source,
    );
    write_per_source(
        output,
        "cell_queue_depth",
        "Pending raw events per producer class",
        MetricType::Gauge,
        cell,
        &summary.queue_depth,
    );
}

fn write_fusion_metrics(output: &mut String, cell: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "cell_fused_events_total",
        "Fused events emitted, alerts included",
        MetricType::Counter,
        cell,
        summary.fused_total,
    );
    write_metric(
        output,
        "cell_unidentified_total",
        "Entry detections that expired without a tag read",
        MetricType::Counter,
        cell,
        summary.unidentified_total,
    );
    write_metric(
        output,
        "cell_ghost_tag_reads_total",
        "Tag reads that expired without an entry detection",
        MetricType::Counter,
        cell,
        summary.ghost_total,
    );
    write_metric(
        output,
        "cell_process_stalled_total",
        "Process cycles that expired without completing",
        MetricType::Counter,
        cell,
        summary.stalled_total,
    );
    write_gauge_f64(
        output,
        "cell_fusion_rate",
        "Share of fused events that were not expiry alerts",
        cell,
        summary.fusion_rate,
    );
    write_histogram(
        output,
        "cell_fusion_latency_ms",
        "Time between the two halves of a fused pair in milliseconds",
        cell,
        &summary.fusion_buckets,
        &METRICS_FUSION_BOUNDS,
        summary.fusion_avg_ms,
    );
}

fn write_delivery_metrics(output: &mut String, cell: &str, summary: &MetricsSummary) {
    write_histogram(
        output,
        "cell_delivery_latency_us",
        "Controller delivery latency in microseconds",
        cell,
        &summary.lat_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.avg_delivery_latency_us,
    );
    write_metric(
        output,
        "cell_delivery_latency_p99_us",
        "99th percentile delivery latency",
        MetricType::Gauge,
        cell,
        summary.lat_p99_us,
    );
    write_metric(
        output,
        "cell_delivery_latency_max_us",
        "Maximum delivery latency since last scrape",
        MetricType::Gauge,
        cell,
        summary.max_delivery_latency_us,
    );
    write_metric(
        output,
        "cell_rejected_events_total",
        "Fused events refused by a controller",
        MetricType::Counter,
        cell,
        summary.rejected_total,
    );
}

fn write_coordination_metrics(output: &mut String, cell: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "cell_alerts_total",
        "Alerts raised by the coordination core",
        MetricType::Counter,
        cell,
        summary.alerts_total,
    );
    write_metric(
        output,
        "cell_handshake_timeouts_total",
        "Corner transfers that timed out waiting for the downstream unit",
        MetricType::Counter,
        cell,
        summary.handshake_timeouts_total,
    );
    write_metric(
        output,
        "cell_corner_refusals_total",
        "Corner requests refused by the collision manager",
        MetricType::Counter,
        cell,
        summary.corner_refusals_total,
    );
    write_metric(
        output,
        "cell_actuator_failures_total",
        "Actuator commands that reported failure",
        MetricType::Counter,
        cell,
        summary.actuator_failures_total,
    );
    write_metric(
        output,
        "cell_telemetry_dropped_total",
        "Telemetry messages dropped because the channel was full",
        MetricType::Counter,
        cell,
        summary.telemetry_dropped_total,
    );
    write_metric(
        output,
        "cell_corners_occupied",
        "Corners currently granted to a transfer",
        MetricType::Gauge,
        cell,
        summary.corners_occupied,
    );
    write_metric(
        output,
        "cell_corners_awaiting_handshake",
        "Corners holding a part until the downstream unit confirms",
        MetricType::Gauge,
        cell,
        summary.corners_awaiting,
    );
    write_metric(
        output,
        "cell_parts_in_progress",
        "Parts identified at a station that have not exited yet",
        MetricType::Gauge,
        cell,
        summary.parts_in_progress as u64,
    );
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    cell_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Full::new(Bytes::from(format_prometheus_metrics(&metrics, &cell_id)))),
        (&Method::GET, "/health") => {
            Response::builder().status(StatusCode::OK).body(Full::new(Bytes::from("ok")))
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found"))),
    };
    // Builder only fails on invalid header input, none of which is dynamic here
    Ok(response.unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))))
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    cell_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let cell_id = Arc::new(cell_id);

    info!(port = %port, cell = %cell_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let cell_id = cell_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let cell_id = cell_id.clone();
                                async move { handle_request(req, metrics, cell_id).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::RawSource;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();
        metrics.record_raw_event(RawSource::Edge);
        metrics.record_raw_event(RawSource::Tag);
        metrics.record_fusion(40);
        metrics.record_delivery(150);
        metrics.record_handshake_timeout();
        metrics.set_corner_gauges(2, 1);
        metrics.set_parts_in_progress(3);

        let output = format_prometheus_metrics(&metrics, "lab");

        assert!(output.contains("cell_raw_events_total{cell=\"lab\",source=\"edge\"} 1"));
        assert!(output.contains("cell_raw_events_total{cell=\"lab\",source=\"polled\"} 0"));
        assert!(output.contains("cell_fusion_latency_ms_bucket{cell=\"lab\",le=\"50\"} 1"));
        assert!(output.contains("cell_delivery_latency_us_count{cell=\"lab\"} 1"));
        assert!(output.contains("cell_handshake_timeouts_total{cell=\"lab\"} 1"));
        assert!(output.contains("cell_corners_occupied{cell=\"lab\"} 2"));
        assert!(output.contains("cell_corners_awaiting_handshake{cell=\"lab\"} 1"));
        assert!(output.contains("cell_parts_in_progress{cell=\"lab\"} 3"));
    }

    #[test]
    fn test_histogram_inf_bucket_counts_everything() {
        let mut output = String::new();
        let mut buckets = [0u64; METRICS_NUM_BUCKETS];
        buckets[0] = 2;
        buckets[METRICS_NUM_BUCKETS - 1] = 3;
        write_histogram(&mut output, "h", "help", "lab", &buckets, &METRICS_BUCKET_BOUNDS, 10);

        assert!(output.contains("h_bucket{cell=\"lab\",le=\"100\"} 2"));
        assert!(output.contains("h_bucket{cell=\"lab\",le=\"51200\"} 2"));
        assert!(output.contains("h_bucket{cell=\"lab\",le=\"+Inf\"} 5"));
        assert!(output.contains("h_count{cell=\"lab\"} 5"));
        assert!(output.contains("h_sum{cell=\"lab\"} 50"));
    }
}
