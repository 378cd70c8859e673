// ABOUTME: Terminal tables for analytics and sweep reports
// ABOUTME: comfy-table rendering shared by the analytics and sweep commands

use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};

use sandkeep_runs::{CostAnalytics, ErrorGroup, ReapOrigin, SweepReport, TrendBucket};

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn money(value: f64) -> String {
    format!("${:.4}", value)
}

fn millis(value: Option<f64>) -> String {
    value
        .map(|ms| format!("{:.0} ms", ms))
        .unwrap_or_else(|| "-".to_string())
}

pub fn cost_table(summary: &CostAnalytics) -> Table {
    let mut table = new_table();
    table.set_header(vec!["Metric", "Value"]);

    let rows = [
        ("Runs", summary.total_runs.to_string()),
        ("Succeeded", summary.succeeded_runs.to_string()),
        ("Failed", summary.failed_runs.to_string()),
        ("Canceled", summary.canceled_runs.to_string()),
        ("Compute cost", money(summary.compute_cost)),
        ("Agent cost", money(summary.agent_cost)),
        ("Total cost", money(summary.total_cost)),
        ("Input tokens", summary.input_tokens.to_string()),
        ("Output tokens", summary.output_tokens.to_string()),
        ("Cached tokens", summary.cached_tokens.to_string()),
        ("Avg duration", millis(summary.avg_duration_ms)),
    ];
    for (metric, value) in rows {
        table.add_row(vec![metric.to_string(), value]);
    }

    table
}

pub fn trends_table(buckets: &[TrendBucket]) -> Table {
    let mut table = new_table();
    table.set_header(vec![
        "Bucket",
        "Runs",
        "Succeeded",
        "Failed",
        "Avg duration",
        "Cost",
    ]);

    for bucket in buckets {
        table.add_row(vec![
            bucket.bucket_start.format("%Y-%m-%d %H:%M").to_string(),
            bucket.runs.to_string(),
            bucket.succeeded.to_string(),
            bucket.failed.to_string(),
            millis(bucket.avg_duration_ms),
            money(bucket.total_cost),
        ]);
    }

    table
}

pub fn errors_table(groups: &[ErrorGroup]) -> Table {
    let mut table = new_table();
    table.set_header(vec!["Code", "Count", "Last seen", "Last message"]);

    for group in groups {
        table.add_row(vec![
            group.code.to_string(),
            group.count.to_string(),
            group.last_seen.format("%Y-%m-%d %H:%M:%S").to_string(),
            group.last_message.clone(),
        ]);
    }

    table
}

pub fn sweep_table(report: &SweepReport) -> Table {
    let mut table = new_table();
    table.set_header(vec![
        "Origin",
        "Found",
        "Killed",
        "Skipped",
        "Errored",
        "Kill failures",
    ]);

    for (label, origin) in [
        ("idle", ReapOrigin::Idle),
        ("stuck booting", ReapOrigin::StuckBooting),
    ] {
        let counts = report.counts(origin);
        table.add_row(vec![
            label.to_string(),
            counts.found.to_string(),
            counts.killed.to_string(),
            counts.skipped.to_string(),
            counts.errored.to_string(),
            counts.kill_failures.to_string(),
        ]);
    }

    table
}
