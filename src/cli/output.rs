// Output formatting and display for CLI

use crate::config::ProcessConfig;
use crate::error::Result;
use crate::process::{ProcessState, StatusReport};
use colored::*;
use std::time::Duration;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print a success message
pub fn print_success_msg(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Render a status report as a one-row table
pub fn status_table(status: &StatusReport) -> String {
    #[derive(Tabled)]
    struct StatusRow {
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "State")]
        state: String,
        #[tabled(rename = "PID")]
        pid: String,
        #[tabled(rename = "Uptime")]
        uptime: String,
        #[tabled(rename = "Restarts")]
        restarts: String,
        #[tabled(rename = "Failures")]
        failures: String,
        #[tabled(rename = "Exit")]
        exit: String,
    }

    let row = StatusRow {
        name: truncate(&status.name, 20),
        state: format_state_colored(status),
        pid: status
            .pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".to_string()),
        uptime: status
            .uptime
            .as_ref()
            .map(format_duration)
            .unwrap_or_else(|| "-".to_string()),
        restarts: status.restarts.to_string(),
        failures: status.consecutive_failures.to_string(),
        exit: status
            .last_exit_code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "-".to_string()),
    };

    let mut table = Table::new([row]);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));

    let mut rendered = format!("\n{}\n", table);

    if let Some(ref error) = status.last_error {
        rendered.push_str(&format!("{} {}\n", "Last error:".bold(), error.red()));
    }
    if status.log_degraded {
        rendered.push_str(&format!("{}\n", "⚠ log output degraded".yellow()));
    }

    rendered
}

/// Render the resolved configuration as a field/value table
pub fn config_table(config: &ProcessConfig) -> Result<String> {
    #[derive(Tabled)]
    struct FieldRow {
        #[tabled(rename = "Field")]
        field: &'static str,
        #[tabled(rename = "Value")]
        value: String,
    }

    let optional_size = |size: Option<crate::config::ByteSize>| {
        size.map(|s| s.to_string())
            .unwrap_or_else(|| "unlimited".to_string())
    };

    let rows = vec![
        FieldRow { field: "name", value: config.name.clone() },
        FieldRow { field: "script", value: config.script.display().to_string() },
        FieldRow { field: "args", value: config.args.join(" ") },
        FieldRow {
            field: "cwd",
            value: config
                .cwd
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".to_string()),
        },
        FieldRow { field: "env", value: format!("{} override(s)", config.env.len()) },
        FieldRow { field: "autostart", value: config.autostart.to_string() },
        FieldRow { field: "autorestart", value: config.autorestart.to_string() },
        FieldRow { field: "max_memory_restart", value: optional_size(config.max_memory_restart) },
        FieldRow { field: "backoff_ms", value: format!("{:?}", config.backoff_ms) },
        FieldRow {
            field: "max_consecutive_failures",
            value: config.max_consecutive_failures.to_string(),
        },
        FieldRow { field: "stop_signal", value: config.stop_signal.clone() },
        FieldRow { field: "kill_timeout_ms", value: config.kill_timeout_ms.to_string() },
        FieldRow { field: "watchdog_interval_ms", value: config.watchdog_interval_ms.to_string() },
        FieldRow { field: "out_file", value: config.out_path().display().to_string() },
        FieldRow { field: "error_file", value: config.error_path().display().to_string() },
        FieldRow { field: "log_date_format", value: config.date_format()? },
        FieldRow { field: "max_log_size", value: optional_size(config.max_log_size) },
    ];

    let mut table = Table::new(rows);
    table.with(Style::rounded());

    Ok(format!("\n{}\n", table))
}

/// Format a process state with color coding
fn format_state_colored(status: &StatusReport) -> String {
    let label = status.state.to_string();
    match status.state {
        ProcessState::Running => label.green().to_string(),
        ProcessState::Starting => label.yellow().to_string(),
        ProcessState::Exited => label.yellow().to_string(),
        ProcessState::Stopped if status.exhausted => format!("{} (gave up)", label).red().bold().to_string(),
        ProcessState::Stopped => label.bright_black().to_string(),
        ProcessState::Failed => label.red().bold().to_string(),
    }
}

/// Format a duration in human-readable format
fn format_duration(duration: &Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        let mins = secs / 60;
        let secs = secs % 60;
        if secs > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}m", mins)
        }
    } else if secs < 86400 {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        if mins > 0 {
            format!("{}h {}m", hours, mins)
        } else {
            format!("{}h", hours)
        }
    } else {
        let days = secs / 86400;
        let hours = (secs % 86400) / 3600;
        if hours > 0 {
            format!("{}d {}h", days, hours)
        } else {
            format!("{}d", days)
        }
    }
}

/// Truncate a string to a maximum length
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
