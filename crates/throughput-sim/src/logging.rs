//! provides logging helpers

use std::collections::BTreeMap;
use std::fmt::{self};
use std::path::Path;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use tracing::field::Field;
use tracing::field::Visit;
use tracing::Event;
use tracing::Subscriber;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::format;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::FormatEvent;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use utils::logging::LOG_PATH_ENV_VAR;

const DEFAULT_METRICS_PREFIX: &str = "metrics.log";
const METRICS_TARGET_PREFIX: &str = "metrics.";

struct InfluxDBFormatter;

/// Splits event fields into line protocol tags (`tag_*`) and fields.
#[derive(Default)]
struct FieldVisitor {
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, String>,
}

impl FieldVisitor {
    fn insert(&mut self, field: &Field, value: String) {
        match field.name().strip_prefix("tag_") {
            Some(tag) => {
                self.tags.insert(tag.to_string(), escape_tag(&value));
            }
            None => {
                self.fields.insert(field.name().to_string(), value);
            }
        }
    }
}

impl Visit for FieldVisitor {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, format!("{value}i"));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, format!("{value}u"));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, value.to_string());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name().starts_with("tag_") {
            self.insert(field, value.to_string());
        } else {
            self.insert(field, format!("\"{}\"", value.replace('"', "\\\"")));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            return;
        }
        self.record_str(field, &format!("{value:?}"));
    }
}

fn escape_tag(value: &str) -> String {
    value
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

fn format_line(measurement: &str, visitor: &FieldVisitor, timestamp_nanos: u128) -> String {
    let mut line = measurement.to_string();
    for (key, value) in &visitor.tags {
        line.push_str(&format!(",{key}={value}"));
    }
    let fields: Vec<String> = visitor
        .fields
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();
    line.push(' ');
    line.push_str(&fields.join(","));
    line.push_str(&format!(" {timestamp_nanos}"));
    line
}

impl<S, N> FormatEvent<S, N> for InfluxDBFormatter
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        if visitor.fields.is_empty() {
            return Ok(());
        }

        let target = event.metadata().target();
        let measurement = target.strip_prefix(METRICS_TARGET_PREFIX).unwrap_or(target);
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();

        writeln!(writer, "{}", format_line(measurement, &visitor, timestamp))
    }
}

fn is_metrics_target(target: &str) -> bool {
    target.starts_with(METRICS_TARGET_PREFIX)
}

/// initiate the global tracing subscriber
///
/// Human readable logs go through [`utils::logging::get_fmt_layer`]; events
/// on `metrics.*` targets are written to `metrics_file` as line protocol when
/// one is given.
pub fn init<P: AsRef<Path>>(
    metrics_file: Option<P>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_path = std::env::var(LOG_PATH_ENV_VAR).ok();
    let fmt_layer = utils::logging::get_fmt_layer(log_path).with_filter(
        utils::logging::env_filter()
            .and(filter::filter_fn(|metadata| !is_metrics_target(metadata.target()))),
    );

    let Some(metrics_file) = metrics_file else {
        registry().with(fmt_layer).init();
        return None;
    };

    let metrics_file = metrics_file.as_ref();
    let rotation_dir = metrics_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let prefix = metrics_file
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(DEFAULT_METRICS_PREFIX);

    let (file_writer, file_guard) = match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(3)
        .build(rotation_dir)
    {
        Ok(appender) => tracing_appender::non_blocking(appender),
        Err(err) => {
            eprintln!(
                "failed to create metrics rolling file appender at {}: {err}; falling back to stdout",
                rotation_dir.display()
            );
            tracing_appender::non_blocking(std::io::stdout())
        }
    };

    let metrics_layer = layer()
        .event_format(InfluxDBFormatter {})
        .fmt_fields(format::DefaultFields::new())
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(filter::filter_fn(|metadata| {
            is_metrics_target(metadata.target())
        }));

    registry().with(fmt_layer).with(metrics_layer).init();
    Some(file_guard)
}
