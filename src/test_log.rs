//! Readable test logs: a compact event formatter and a layer logging span entries.
//!
//! Call [`init`] at the start of a test and run it with e.g.
//! `RUST_LOG=eos_alloc=debug cargo test -- --nocapture`.

use std::fmt;
use std::sync::Once;

use nu_ansi_term::Color;
use tracing::{debug, error, info, span, trace, warn};
use tracing::{Event, Id, Level, Subscriber};
use tracing_subscriber::fmt::format::{DefaultFields, FormatEvent, FormatFields};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::{format, FormattedFields};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Registry};

static INIT: Once = Once::new();

/// Installs the global subscriber once, filtered by `RUST_LOG`.
pub fn init() {
    INIT.call_once(|| {
        let subscriber = Registry::default()
            .with(EnvFilter::from_default_env())
            .with(RecordEntryLayer::default())
            .with(
                tracing_subscriber::fmt::layer()
                    .event_format(SimpleFormatter)
                    .with_test_writer(),
            );
        // Another test harness may have installed one already.
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

#[derive(Default)]
pub struct RecordEntryLayer {
    fmt_fields: DefaultFields,
}

impl<S> Layer<S> for RecordEntryLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        let mut fields = FormattedFields::<DefaultFields>::new(String::new());
        if self.fmt_fields.format_fields(fields.as_writer(), attrs).is_ok() {
            span.extensions_mut().insert(fields);
        }
    }

    fn on_enter(&self, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        let extensions = span.extensions();
        let Some(fields) = extensions.get::<FormattedFields<DefaultFields>>() else {
            return;
        };

        // event!() needs a constant level.
        match *span.metadata().level() {
            Level::TRACE => trace!(args = %fields, "Enter."),
            Level::DEBUG => debug!(args = %fields, "Enter."),
            Level::INFO => info!(args = %fields, "Enter."),
            Level::WARN => warn!(args = %fields, "Enter."),
            Level::ERROR => error!(args = %fields, "Enter."),
        }
    }
}

#[derive(Default)]
pub struct SimpleFormatter;

impl<S, N> FormatEvent<S, N> for SimpleFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(writer, "{}: ", FmtLevel(event.metadata().level()))?;
        match ctx.lookup_current() {
            Some(span) => write!(writer, "{}: ", Color::Purple.paint(span.name()))?,
            None => write!(writer, "{}: ", Color::DarkGray.paint(event.metadata().target()))?,
        }
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

struct FmtLevel<'a>(&'a Level);

impl fmt::Display for FmtLevel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self.0 {
            Level::TRACE => write!(f, "{}", Color::Purple.paint("TRACE")),
            Level::DEBUG => write!(f, "{}", Color::Blue.paint("DEBUG")),
            Level::INFO => write!(f, "{}", Color::Green.paint(" INFO")),
            Level::WARN => write!(f, "{}", Color::Yellow.paint(" WARN")),
            Level::ERROR => write!(f, "{}", Color::Red.paint("ERROR")),
        }
    }
}
