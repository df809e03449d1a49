//! Tracing setup for the orchestrator binaries.
//!
//! Configured entirely from the environment:
//!
//! | Variable        | Values                    | Default               |
//! |-----------------|---------------------------|-----------------------|
//! | `LOG_LEVEL`     | any `EnvFilter` directive | `info`                |
//! | `LOG_OUTPUT`    | `console`, `file`, `both` | `console`             |
//! | `LOG_FORMAT`    | `human`, `json`           | `human`               |
//! | `LOG_FILE_PATH` | path of the rolling file  | `/tmp/ws-worker.log`  |
//! | `LOG_TAGS`      | `key:value,...`           | none                  |
//!
//! `RUST_LOG` takes precedence over `LOG_LEVEL`. `LOG_TAGS` keeps only events
//! emitted inside a span carrying every listed field, e.g.
//! `LOG_TAGS=workspace_id:3f2a` follows a single workspace through the worker.

use std::{collections::HashMap, env, path::Path};
use tracing::{field::Visit, span, Metadata, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::MakeWriter,
    layer::{Context, Layer},
    prelude::*,
    registry::LookupSpan,
    EnvFilter,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
    Off,
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub level: String,
    pub output: LogOutput,
    pub json: bool,
    pub file_path: String,
    pub tags: Vec<(String, String)>,
}

impl LogSettings {
    pub fn from_env() -> Self {
        let output = match env::var("LOG_OUTPUT").as_deref() {
            Ok("file") => LogOutput::File,
            Ok("both") => LogOutput::Both,
            Ok("off") => LogOutput::Off,
            _ => LogOutput::Console,
        };

        Self {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            output,
            json: env::var("LOG_FORMAT").is_ok_and(|f| f == "json"),
            file_path: env::var("LOG_FILE_PATH")
                .unwrap_or_else(|_| "/tmp/ws-worker.log".to_string()),
            tags: parse_tags(&env::var("LOG_TAGS").unwrap_or_default()),
        }
    }
}

/// Parse `key:value,key2:value2`; malformed entries are skipped.
pub fn parse_tags(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|entry| {
            let (key, value) = entry.split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Span fields recorded for tag filtering.
struct SpanFields(HashMap<String, String>);

struct FieldVisitor<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0
            .insert(field.name().to_string(), format!("{value:?}"));
    }
}

struct TagFilterLayer {
    tags: Vec<(String, String)>,
}

impl<S> Layer<S> for TagFilterLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut fields = HashMap::new();
        attrs.record(&mut FieldVisitor(&mut fields));
        span.extensions_mut().insert(SpanFields(fields));
    }

    fn enabled(&self, _meta: &Metadata<'_>, ctx: Context<'_, S>) -> bool {
        if self.tags.is_empty() {
            return true;
        }

        let Some(scope) = ctx.current_span().id().and_then(|id| ctx.span_scope(id)) else {
            return false;
        };

        let mut seen = HashMap::new();
        for span_ref in scope {
            if let Some(fields) = span_ref.extensions().get::<SpanFields>() {
                for (k, v) in &fields.0 {
                    seen.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }

        self.tags.iter().all(|(key, want)| {
            seen.get(key)
                .is_some_and(|value: &String| want == "*" || value.contains(want.as_str()))
        })
    }
}

fn fmt_layer<S, W>(writer: W, json: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer().with_writer(writer);
    if json {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

/// Initializes the global tracing subscriber from the environment.
///
/// The returned guard must be held for the life of the process when file
/// output is enabled, otherwise buffered lines are lost on exit.
pub fn init_subscriber() -> Option<WorkerGuard> {
    init_with(LogSettings::from_env())
}

pub fn init_with(settings: LogSettings) -> Option<WorkerGuard> {
    let mut env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.level));
    for directive in ["hyper=warn", "reqwest=warn", "sqlx=warn"] {
        if let Ok(directive) = directive.parse() {
            env_filter = env_filter.add_directive(directive);
        }
    }

    let mut layers: Vec<Box<dyn Layer<_> + Send + Sync>> = Vec::new();
    let mut guard = None;

    if matches!(settings.output, LogOutput::Console | LogOutput::Both) {
        layers.push(fmt_layer(std::io::stdout, settings.json));
    }

    if matches!(settings.output, LogOutput::File | LogOutput::Both) {
        let log_path = Path::new(&settings.file_path);
        let log_dir = log_path.parent().unwrap_or_else(|| Path::new("/tmp"));
        let log_filename = log_path
            .file_name()
            .unwrap_or_else(|| "ws-worker.log".as_ref());
        let appender = tracing_appender::rolling::daily(log_dir, log_filename);
        let (non_blocking, file_guard) = tracing_appender::non_blocking(appender);
        guard = Some(file_guard);
        layers.push(fmt_layer(non_blocking, settings.json));
    }

    let result = tracing_subscriber::registry()
        .with(env_filter)
        .with(TagFilterLayer {
            tags: settings.tags,
        })
        .with(layers)
        .try_init();

    if let Err(e) = result {
        eprintln!("tracing subscriber already initialized: {e}");
    }

    guard
}
