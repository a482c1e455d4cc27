//! Bridges `tracing` events into the log pipeline.

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context as LayerContext;
use tracing_subscriber::registry::LookupSpan;

use super::FALLBACK_TARGET;
use super::emitter::LogEmitter;
use super::record::{Category, Context, ContextValue, Level, LogRecord};

/// Forwards every event to a [`LogEmitter`].
///
/// The event target becomes the logger name and picks the category via
/// [`Category::for_target`]. Events on the fallback target are skipped so
/// pipeline failures never feed back into the pipeline.
#[derive(Debug, Clone)]
pub struct EmitterLayer {
    emitter: LogEmitter,
}

impl EmitterLayer {
    /// Creates a layer feeding `emitter`.
    #[must_use]
    pub fn new(emitter: LogEmitter) -> Self {
        Self { emitter }
    }
}

impl<S> Layer<S> for EmitterLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        let metadata = event.metadata();
        let target = metadata.target();
        if target == FALLBACK_TARGET {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let record = LogRecord::new(
            Level::from(metadata.level()),
            Category::for_target(target),
            target,
            visitor.message.unwrap_or_default(),
            visitor.context,
        );
        self.emitter.emit_record(record);
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    context: Context,
}

impl FieldVisitor {
    fn insert(&mut self, field: &Field, value: ContextValue) {
        if field.name() == "message" {
            self.message = Some(match value {
                ContextValue::Str(s) => s,
                ContextValue::Bool(b) => b.to_string(),
                ContextValue::Int(i) => i.to_string(),
                ContextValue::Float(f) => f.to_string(),
            });
        } else {
            self.context.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, value.into());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, value.into());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, value.into());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.insert(field, ContextValue::Str(format!("{value:?}")));
    }
}
