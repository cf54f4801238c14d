use std::fmt;
use std::io::IsTerminal;

use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::config::types::LogFormat;

/// Tracing formatter that prepends colored [ALLOW]/[DENY] prefixes to
/// proxy and control-plane events, and colorizes known field names.
pub struct PrefixedFormatter<E> {
    inner: E,
    ansi: bool,
}

impl<E> PrefixedFormatter<E> {
    pub fn new(inner: E, ansi: bool) -> Self {
        Self { inner, ansi }
    }
}

impl<S, N, E> FormatEvent<S, N> for PrefixedFormatter<E>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
    E: FormatEvent<S, N>,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = MessageVisitor {
            message: String::new(),
        };
        event.record(&mut visitor);
        if let Some(tag) = Tag::classify(&visitor.message.to_lowercase()) {
            if self.ansi {
                write!(writer, "\x1b[{}m[{}]\x1b[0m ", tag.color(), tag.label())?;
            } else {
                write!(writer, "[{}] ", tag.label())?;
            }
        }

        if self.ansi {
            let mut buf = String::new();
            let buf_writer = Writer::new(&mut buf);
            self.inner.format_event(ctx, buf_writer, event)?;
            let colorized = colorize_fields(&buf);
            write!(writer, "{}", colorized)?;
            Ok(())
        } else {
            self.inner.format_event(ctx, writer, event)
        }
    }
}

/// Colorize known field names in a log line.
fn colorize_fields(line: &str) -> String {
    let mut result = line.to_string();
    for (field, color) in FIELD_COLORS {
        let pattern = format!("{}=", field);
        if result.contains(&pattern) {
            let colored = format!("\x1b[{}m{}=\x1b[0m", color, field);
            result = result.replace(&pattern, &colored);
        }
    }
    result
}

/// Field name → ANSI color code mapping.
const FIELD_COLORS: &[(&str, &str)] = &[
    ("username", "36"),
    ("user", "36"),
    ("upstream", "33"),
    ("session", "33"),
    ("peer", "35"),
    ("listen", "35"),
    ("conn_id", "2"),
    ("proxy_id", "2"),
    ("channel_id", "2"),
    ("bytes", "32"),
    ("events", "32"),
    ("error", "31"),
    ("reason", "31"),
];

/// Visitor that extracts the message field from a tracing event.
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}

/// Prefix attached to a log line based on its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Allow,
    Deny,
}

impl Tag {
    fn classify(msg: &str) -> Option<Tag> {
        if is_deny_pattern(msg) {
            Some(Tag::Deny)
        } else if is_allow_pattern(msg) {
            Some(Tag::Allow)
        } else {
            None
        }
    }

    fn label(self) -> &'static str {
        match self {
            Tag::Allow => "ALLOW",
            Tag::Deny => "DENY",
        }
    }

    fn color(self) -> &'static str {
        match self {
            Tag::Allow => "34",
            Tag::Deny => "31",
        }
    }
}

fn is_deny_pattern(msg: &str) -> bool {
    msg.contains("denied")
        || msg.contains("rejected")
        || msg.contains("auth failed")
        || msg.contains("hmac does not match")
        || msg.contains("upstream connect failed")
        || msg.contains("upstream auth failed")
        || msg.contains("public query disabled")
}

fn is_allow_pattern(msg: &str) -> bool {
    msg.contains("relay completed")
        || msg.contains("auth success")
        || msg.contains("session finalized")
}

/// Install the global tracing subscriber. `level` is an `EnvFilter` directive
/// and falls back to `info` when it does not parse.
pub fn setup_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        LogFormat::Pretty => {
            let ansi = std::io::stdout().is_terminal();
            let default_format = tracing_subscriber::fmt::format::Format::default();
            tracing_subscriber::fmt()
                .event_format(PrefixedFormatter::new(default_format, ansi))
                .with_env_filter(filter)
                .init();
        }
    }
}
