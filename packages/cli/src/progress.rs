//! Terminal progress and logging for the `census_explorer` binary.

use std::sync::Arc;
use std::time::Duration;

use census_explorer_census::progress::ProgressCallback;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::LevelFilter;

const SPINNER_TEMPLATE: &str = "{spinner:.cyan} {msg}";
const YEARS_TEMPLATE: &str = "{spinner:.cyan} [{bar:30.cyan/dim}] {pos}/{len} years, last: {msg}";

/// Per-year progress of a time-series fetch.
///
/// Shows a spinner until the number of distinct years is known, then a
/// bar whose message is the most recently requested vintage.
pub struct YearsProgress {
    bar: ProgressBar,
}

impl YearsProgress {
    #[must_use]
    pub fn start(multi: &MultiProgress, message: &str) -> Arc<dyn ProgressCallback> {
        let bar = multi.add(ProgressBar::new_spinner());
        bar.set_style(style(SPINNER_TEMPLATE, ProgressStyle::default_spinner()));
        bar.enable_steady_tick(Duration::from_millis(120));
        bar.set_message(message.to_string());
        Arc::new(Self { bar })
    }
}

fn style(template: &str, fallback: ProgressStyle) -> ProgressStyle {
    ProgressStyle::with_template(template).unwrap_or(fallback)
}

impl ProgressCallback for YearsProgress {
    fn set_total(&self, total: u64) {
        self.bar.set_length(total);
        self.bar.set_style(
            style(YEARS_TEMPLATE, ProgressStyle::default_bar()).progress_chars("=> "),
        );
    }

    fn inc(&self, delta: u64) {
        self.bar.inc(delta);
    }

    fn set_message(&self, msg: String) {
        self.bar.set_message(msg);
    }

    fn finish(&self, msg: String) {
        self.bar.set_style(style(SPINNER_TEMPLATE, ProgressStyle::default_spinner()));
        self.bar.finish_with_message(msg);
    }
}

/// Installs `pretty_env_logger` behind `indicatif-log-bridge`.
///
/// Without `RUST_LOG` only warnings are shown, so table and CSV output
/// stay clean. Progress bars must be added to the returned
/// [`MultiProgress`].
#[must_use]
pub fn init_logger() -> MultiProgress {
    let multi = MultiProgress::new();

    let mut builder = pretty_env_logger::formatted_builder();
    builder.filter_level(LevelFilter::Warn);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    let logger = builder.build();
    let level = logger.filter();

    if indicatif_log_bridge::LogWrapper::new(multi.clone(), logger)
        .try_init()
        .is_ok()
    {
        log::set_max_level(level);
    }

    multi
}
