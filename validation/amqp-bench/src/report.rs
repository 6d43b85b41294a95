//! Results reporting and formatting.

use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};

use crate::runner::BenchResults;

/// Extra output printed after the two count lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Count lines only
    #[default]
    Plain,
    Table,
    Json,
}

/// Formats benchmark results for output.
pub struct ResultsReport;

impl ResultsReport {
    /// The two lines every run ends with.
    pub fn final_lines(results: &BenchResults) -> String {
        format!(
            "Published: {} messages\nConsumed: {} messages",
            results.published, results.consumed
        )
    }

    /// Format results as a console table.
    pub fn format_table(results: &BenchResults) -> String {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec![
                "Benchmark Results".to_string(),
                format!("{} exchange", results.exchange_type),
            ]);

        table.add_row(vec!["Run time:", &format!("{:.1}s", results.run_secs)]);
        table.add_row(vec![
            "Workers:",
            &format!(
                "{} producer(s) / {} consumer(s)",
                results.producers_started, results.consumers_started
            ),
        ]);
        table.add_row(vec![
            "Target rate:",
            &if results.rate == 0 {
                "unthrottled".to_string()
            } else {
                format!("{} msg/s per producer", results.rate)
            },
        ]);
        table.add_row(vec!["Payload:", &format!("{} bytes", results.size)]);

        table.add_row(vec!["", ""]);
        table.add_row(vec!["Published:", &results.published.to_string()]);
        table.add_row(vec!["Consumed:", &results.consumed.to_string()]);
        table.add_row(vec![
            "Throughput:",
            &format!(
                "{:.1} pub/s, {:.1} con/s",
                results.published_per_sec, results.consumed_per_sec
            ),
        ]);

        if results.publisher_confirm {
            table.add_row(vec!["Nacked:", &results.nacked.to_string()]);
        }
        if results.consumer_confirm {
            table.add_row(vec!["Ack failures:", &results.ack_failures.to_string()]);
        }
        table.add_row(vec!["Publish errors:", &results.publish_errors.to_string()]);

        if let Some(ref teardown) = results.teardown {
            table.add_row(vec![
                "Cleanup:",
                &format!(
                    "{} queue(s), {} exchange(s), {} failure(s)",
                    teardown.deleted_queues, teardown.deleted_exchanges, teardown.failures
                ),
            ]);
        } else {
            table.add_row(vec!["Cleanup:", "skipped"]);
        }

        table.to_string()
    }

    /// Format results as JSON.
    pub fn format_json(results: &BenchResults) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(results)?)
    }

    /// Everything printed to stdout at the end of a run.
    pub fn render(results: &BenchResults, format: OutputFormat) -> anyhow::Result<String> {
        let mut out = Self::final_lines(results);
        match format {
            OutputFormat::Plain => {}
            OutputFormat::Table => {
                out.push('\n');
                out.push_str(&Self::format_table(results));
            }
            OutputFormat::Json => {
                out.push('\n');
                out.push_str(&Self::format_json(results)?);
            }
        }
        Ok(out)
    }
}
