// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log line formatter.
//!
//! ```text
//! SFX_WRITER | LEVEL | component | [outer{fields}:inner{fields}: ]message fields
//! ```
//!
//! `component` is the last segment of the event's target, so lines from the dimension
//! client, the batch writers and the fan-out can be told apart without full paths.

use std::fmt::{self, Write as _};
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;

pub const LOG_PREFIX: &str = "SFX_WRITER";

#[derive(Debug, Clone, Copy)]
pub struct Formatter {
    prefix: &'static str,
}

impl Default for Formatter {
    fn default() -> Self {
        Self { prefix: LOG_PREFIX }
    }
}

impl Formatter {
    #[must_use]
    pub const fn with_prefix(prefix: &'static str) -> Self {
        Self { prefix }
    }
}

fn component(target: &str) -> &str {
    target.rsplit("::").next().unwrap_or(target)
}

/// Writes the active spans, root first, as `a{x=1}:b: `. Writes nothing outside a span.
fn write_spans<S, N>(ctx: &FmtContext<'_, S, N>, writer: &mut format::Writer<'_>) -> fmt::Result
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    let Some(scope) = ctx.event_scope() else {
        return Ok(());
    };

    let mut any = false;
    for span in scope.from_root() {
        if any {
            writer.write_char(':')?;
        }
        writer.write_str(span.name())?;
        let extensions = span.extensions();
        if let Some(fields) = extensions
            .get::<FormattedFields<N>>()
            .filter(|fields| !fields.is_empty())
        {
            write!(writer, "{{{fields}}}")?;
        }
        any = true;
    }
    if any {
        writer.write_str(": ")?;
    }
    Ok(())
}

impl<S, N> FormatEvent<S, N> for Formatter
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
        let metadata = event.metadata();
        write!(
            writer,
            "{} | {} | {} | ",
            self.prefix,
            metadata.level(),
            component(metadata.target())
        )?;
        write_spans(ctx, &mut writer)?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
