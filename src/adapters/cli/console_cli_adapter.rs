use crate::core::error::CliError;
use crate::core::types::{
    BACKUP_TIMESTAMP_DISPLAY, BackupInfo, MessageLevel, RollbackStatus, UpdateCheck,
    UpdateResult, VersionInfo,
};
use colored::*;
use serde::Serialize;
use std::path::Path;

/// Renders command results as colored text, or as pretty JSON when `json` is set.
pub(crate) struct ConsoleCliAdapter {
    colors_enabled: bool,
    json: bool,
}

impl ConsoleCliAdapter {
    pub(crate) fn new(colors_enabled: bool, json: bool) -> Self {
        Self {
            colors_enabled,
            json,
        }
    }

    fn colorize(&self, text: &str, color: Color) -> ColoredString {
        if self.colors_enabled {
            text.color(color)
        } else {
            text.normal()
        }
    }

    fn yes_no(&self, value: bool) -> ColoredString {
        if value {
            self.colorize("Yes", Color::Green)
        } else {
            self.colorize("No", Color::Yellow)
        }
    }

    fn print_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), CliError> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    pub(crate) fn display_message(&self, message: &str, level: MessageLevel) {
        let level_str = format!("[{:<7}]", format!("{level:?}").to_uppercase());
        match level {
            MessageLevel::Error => {
                eprintln!("{} {}", self.colorize(&level_str, Color::Red), message)
            }
            MessageLevel::Warning => {
                println!("{} {}", self.colorize(&level_str, Color::Yellow), message)
            }
            MessageLevel::Info => {
                println!("{} {}", self.colorize(&level_str, Color::Cyan), message)
            }
        }
    }

    pub(crate) fn display_error(&self, error: &dyn std::error::Error) {
        if self.json {
            let mut causes = Vec::new();
            let mut source = error.source();
            while let Some(src) = source {
                causes.push(src.to_string());
                source = src.source();
            }
            let body = serde_json::json!({ "error": error.to_string(), "causes": causes });
            eprintln!("{body}");
            return;
        }
        eprintln!("{} {}", self.colorize("[ERROR]", Color::Red).bold(), error);
        let mut source = error.source();
        while let Some(src) = source {
            eprintln!("  Caused by: {src}");
            source = src.source();
        }
    }

    pub(crate) fn display_version_info(&self, info: &VersionInfo) -> Result<(), CliError> {
        if self.json {
            return self.print_json(info);
        }
        println!(
            "  Current version: {}",
            self.colorize(&info.current_version, Color::Green)
        );
        match (&info.latest_version, &info.latest_error) {
            (Some(latest), _) => println!("  Latest release:  {}", self.colorize(latest, Color::Cyan)),
            (None, Some(err)) => println!(
                "  Latest release:  {}",
                self.colorize(&format!("unavailable ({err})"), Color::Red)
            ),
            (None, None) => println!("  Latest release:  unknown"),
        }
        Ok(())
    }

    pub(crate) fn display_update_check(&self, check: &UpdateCheck) -> Result<(), CliError> {
        if self.json {
            return self.print_json(check);
        }
        println!("{}", self.colorize("Update check:", Color::Green).bold());
        println!("  Current version:  {}", check.current_version);
        println!(
            "  Latest version:   {}",
            self.colorize(&check.latest_version, Color::Cyan)
        );
        println!("  Update available: {}", self.yes_no(check.has_update));
        if let Some(published) = check.release.published_at {
            println!("  Published:        {}", published.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        if !check.release.html_url.is_empty() {
            println!("  Release page:     {}", check.release.html_url);
        }
        let notes = check.release.body.trim();
        if check.has_update && !notes.is_empty() {
            println!("{}", self.colorize("\n  Changelog:", Color::Cyan));
            for line in notes.lines() {
                println!("    {line}");
            }
        }
        Ok(())
    }

    pub(crate) fn display_update_result(&self, result: &UpdateResult) -> Result<(), CliError> {
        if self.json {
            return self.print_json(result);
        }
        let level = if result.success {
            MessageLevel::Info
        } else {
            MessageLevel::Error
        };
        self.display_message(&result.message, level);
        println!("  Version:  {} -> {}", result.from_version, result.version);
        println!("  Stage:    {}", result.stage);
        if let Some(stage) = result.failed_stage {
            println!("  Failed:   {}", self.colorize(&stage.to_string(), Color::Red));
        }
        println!("  Duration: {:.1}s", result.duration.as_secs_f64());
        if let Some(path) = &result.backup_path {
            println!("  Backup:   {}", self.colorize(&path.display().to_string(), Color::Yellow));
        }
        Ok(())
    }

    pub(crate) fn display_backups(&self, backups: &[BackupInfo]) -> Result<(), CliError> {
        if self.json {
            return self.print_json(backups);
        }
        if backups.is_empty() {
            self.display_message("No backups found.", MessageLevel::Info);
            return Ok(());
        }
        self.display_table(
            ["Version", "Created", "Size", "Path"]
                .iter()
                .map(|h| h.to_string())
                .collect(),
            backup_rows(backups),
        );
        Ok(())
    }

    pub(crate) fn display_rollback(
        &self,
        backup_path: &Path,
        status: RollbackStatus,
    ) -> Result<(), CliError> {
        if self.json {
            return self.print_json(&serde_json::json!({
                "backup_path": backup_path,
                "status": status,
            }));
        }
        let color = match status {
            RollbackStatus::Completed => Color::Green,
            RollbackStatus::Started => Color::Yellow,
        };
        println!(
            "{} from {}",
            self.colorize(&status.to_string(), color).bold(),
            backup_path.display()
        );
        if status == RollbackStatus::Started {
            println!("  The restore continues in the background; check the rollback log for its outcome.");
        }
        Ok(())
    }

    pub(crate) fn display_table(&self, headers: Vec<String>, rows: Vec<Vec<String>>) {
        if headers.is_empty() && rows.is_empty() {
            return;
        }

        let mut column_widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
        for row in &rows {
            for (i, cell) in row.iter().enumerate() {
                if i < column_widths.len() {
                    column_widths[i] = column_widths[i].max(cell.len());
                } else {
                    column_widths.push(cell.len());
                }
            }
        }

        if !headers.is_empty() {
            for (i, header) in headers.iter().enumerate() {
                print!(
                    "| {:<width$} ",
                    self.colorize(header, Color::Yellow).bold(),
                    width = column_widths[i]
                );
            }
            println!("|");
            for width in &column_widths {
                print!("+-{}-", "-".repeat(*width));
            }
            println!("+");
        }

        for row in rows {
            for (i, cell) in row.iter().enumerate() {
                print!(
                    "| {:<width$} ",
                    cell,
                    width = column_widths.get(i).copied().unwrap_or(cell.len())
                );
            }
            println!("|");
        }
    }
}

fn backup_rows(backups: &[BackupInfo]) -> Vec<Vec<String>> {
    backups
        .iter()
        .map(|b| {
            vec![
                b.version.clone(),
                b.timestamp.format(BACKUP_TIMESTAMP_DISPLAY).to_string(),
                format_size(b.size),
                b.path.display().to_string(),
            ]
        })
        .collect()
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}
