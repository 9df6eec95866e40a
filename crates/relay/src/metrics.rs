use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
};

use taskhub_common::types::CallOutcome;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

type LabelCounters = Mutex<HashMap<String, u64>>;

#[derive(Default)]
pub struct RelayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_events_total: LabelCounters,
    ws_errors_total: LabelCounters,
    ws_duration_sum_ms: LabelCounters,
    fanout_deliveries_total: LabelCounters,
    fanout_empty_total: LabelCounters,
    call_outcomes_total: LabelCounters,
    connections_active: AtomicI64,
    connections_total: AtomicU64,
}

const CALL_OUTCOMES: [CallOutcome; 4] =
    [CallOutcome::Ended, CallOutcome::Missed, CallOutcome::NoAnswer, CallOutcome::Rejected];
static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

pub fn record_ws_event(event: &str, is_error: bool, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_event(event, is_error, latency_ms);
    }
}

pub fn record_delivery(event: &str, delivered: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.record_delivery(event, delivered);
    }
}

pub fn record_call_outcome(outcome: CallOutcome) {
    if let Some(metrics) = global_metrics() {
        metrics.record_call_outcome(outcome);
    }
}

pub fn connection_opened() {
    if let Some(metrics) = global_metrics() {
        metrics.connection_opened();
    }
}

pub fn connection_closed() {
    if let Some(metrics) = global_metrics() {
        metrics.connection_closed();
    }
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_ws_event(&self, event: &str, is_error: bool, latency_ms: u64) {
        let label = normalize_label(event);
        increment_label_counter(&self.ws_events_total, &label, 1);
        increment_label_counter(&self.ws_duration_sum_ms, &label, latency_ms);
        if is_error {
            increment_label_counter(&self.ws_errors_total, &label, 1);
        }
    }

    pub fn record_delivery(&self, event: &str, delivered: usize) {
        let label = normalize_label(event);
        if delivered == 0 {
            increment_label_counter(&self.fanout_empty_total, &label, 1);
        } else {
            let delivered = u64::try_from(delivered).unwrap_or(u64::MAX);
            increment_label_counter(&self.fanout_deliveries_total, &label, delivered);
        }
    }

    pub fn record_call_outcome(&self, outcome: CallOutcome) {
        increment_label_counter(&self.call_outcomes_total, outcome.as_str(), 1);
    }

    pub fn connection_opened(&self) {
        self.connections_active.fetch_add(1, Ordering::SeqCst);
        self.connections_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE relay_request_rate_total counter\n");
        append_counter_lines(&mut output, "relay_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP relay_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE relay_request_errors_total counter\n");
        append_counter_lines(&mut output, "relay_request_errors_total", &self.request_errors_total);

        output.push_str("# HELP relay_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP relay_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str("# HELP relay_ws_events_total Total inbound websocket events by name.\n");
        output.push_str("# TYPE relay_ws_events_total counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_events_total",
            "event",
            &self.ws_events_total,
        );

        output.push_str(
            "# HELP relay_ws_errors_total Inbound websocket events answered with an error frame.\n",
        );
        output.push_str("# TYPE relay_ws_errors_total counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_errors_total",
            "event",
            &self.ws_errors_total,
        );

        output.push_str("# HELP relay_ws_duration_ms_sum Sum of inbound event handling time in milliseconds.\n");
        output.push_str("# TYPE relay_ws_duration_ms_sum counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_duration_ms_sum",
            "event",
            &self.ws_duration_sum_ms,
        );

        output.push_str(
            "# HELP relay_fanout_deliveries_total Outbound events queued to connections by name.\n",
        );
        output.push_str("# TYPE relay_fanout_deliveries_total counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_fanout_deliveries_total",
            "event",
            &self.fanout_deliveries_total,
        );

        output.push_str(
            "# HELP relay_fanout_empty_total Publishes that reached no connection by name.\n",
        );
        output.push_str("# TYPE relay_fanout_empty_total counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_fanout_empty_total",
            "event",
            &self.fanout_empty_total,
        );

        output.push_str("# HELP relay_call_outcomes_total Retired call sessions by outcome.\n");
        output.push_str("# TYPE relay_call_outcomes_total counter\n");
        {
            let guard = lock(&self.call_outcomes_total);
            for outcome in CALL_OUTCOMES {
                let value = guard.get(outcome.as_str()).copied().unwrap_or(0);
                output.push_str(&format!(
                    "relay_call_outcomes_total{{outcome=\"{}\"}} {value}\n",
                    outcome.as_str()
                ));
            }
        }

        output.push_str("# HELP relay_connections_active Currently open websocket connections.\n");
        output.push_str("# TYPE relay_connections_active gauge\n");
        output.push_str(&format!(
            "relay_connections_active {}\n",
            self.connections_active.load(Ordering::SeqCst).max(0)
        ));

        output.push_str(
            "# HELP relay_connections_total Websocket connections accepted since start.\n",
        );
        output.push_str("# TYPE relay_connections_total counter\n");
        output.push_str(&format!(
            "relay_connections_total {}\n",
            self.connections_total.load(Ordering::SeqCst)
        ));

        output
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn normalize_endpoint(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut normalized_segments = Vec::new();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        if uuid::Uuid::parse_str(segment).is_ok() {
            normalized_segments.push("{uuid}".to_string());
            continue;
        }

        if segment.chars().all(|character| character.is_ascii_digit()) {
            normalized_segments.push("{number}".to_string());
            continue;
        }

        normalized_segments.push(segment.to_string());
    }

    if normalized_segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", normalized_segments.join("/"))
    }
}

fn normalize_label(label: &str) -> String {
    let normalized = label.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = lock(map);
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &LabelCounters, label: &str, delta: u64) {
    let mut guard = lock(map);
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &LabelCounters,
) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
