// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tracing setup for the forwarder.
//!
//! Every line is prefixed with `DD_LOG_FORWARDER` so the forwarder's own
//! diagnostics can be told apart from the logs it forwards:
//!
//! ```text
//! DD_LOG_FORWARDER | WARN | Dropped message in pipeline=logs reason=too-large ContentLength=12 ContentSizeLimit=10
//! DD_LOG_FORWARDER | DEBUG | replay{files=3}: RETRY | Replaying 2 transactions
//! ```

use std::fmt;

use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::errors::ConfigError;

const LOG_PREFIX: &str = "DD_LOG_FORWARDER";

/// Event formatter writing `DD_LOG_FORWARDER | LEVEL | spans: message fields`.
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

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
        write!(&mut writer, "{LOG_PREFIX} | {} | ", event.metadata().level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Filter directives for `log_level`, with the chatty HTTP stack silenced.
pub fn env_filter(log_level: &str) -> Result<EnvFilter, ConfigError> {
    EnvFilter::try_new(format!("h2=off,hyper=off,rustls=off,{log_level}"))
        .map_err(|e| ConfigError::Invalid(format!("could not parse log level {log_level}: {e}")))
}

/// Installs the global subscriber. Fails if the level does not parse or a
/// subscriber is already installed.
pub fn init(log_level: &str) -> Result<(), ConfigError> {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter(log_level)?)
        .event_format(Formatter)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| ConfigError::Invalid(format!("failed to set tracing subscriber: {e}")))
}
