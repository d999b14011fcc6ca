// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::anyhow;
use anyhow::Context as _;
use std::io::IsTerminal;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::Format;
use tracing_subscriber::fmt::time::uptime;
use tracing_subscriber::EnvFilter;

/// Enables tracing output to stderr, filtered by `CDROM_TAP_LOG`.
pub fn enable_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = if let Ok(filter) = std::env::var("CDROM_TAP_LOG") {
        EnvFilter::try_new(filter).context("invalid CDROM_TAP_LOG")?
    } else {
        EnvFilter::default().add_directive(LevelFilter::INFO.into())
    };

    let is_terminal = std::io::stderr().is_terminal();
    let format = Format::default()
        .with_timer(uptime())
        .with_ansi(is_terminal);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .event_format(format)
        .log_internal_errors(true)
        .with_writer(std::io::stderr);

    tracing_subscriber::Registry::default()
        .with(fmt_layer)
        .with(filter)
        .try_init()
        .map_err(|e| anyhow!(e).context("failed to enable tracing"))?;

    Ok(())
}
