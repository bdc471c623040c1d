use anyhow::Result;
use clap::ValueEnum;
use colored::{Color, Colorize};
use comfy_table::{Attribute, Cell, Table};
use entwine::{Change, CommitReceipt, GraphIssue};
use serde::Serialize;
use std::io::Write;

use crate::theme::{ICONS, THEME, table_color};

/// Output format options for CLI commands
#[derive(Clone, Debug, ValueEnum, Default, PartialEq)]
pub enum OutputFormat {
    /// Formatted table output (default)
    #[default]
    Table,
    /// JSON output for scripting
    Json,
    /// Compact single-line output
    Compact,
}

/// Global CLI options that affect output and behavior
#[derive(Clone, Debug, Default)]
pub struct GlobalOptions {
    pub output_format: OutputFormat,
    pub quiet: bool,
    pub verbose: bool,
    pub no_color: bool,
}

/// Trait for data that can be displayed as a table
pub trait TableDisplay {
    fn to_table(&self, options: &GlobalOptions) -> Table;
    fn to_compact(&self) -> String;
}

/// Output manager handles formatting and display
pub struct OutputManager {
    pub options: GlobalOptions,
}

impl OutputManager {
    pub fn new(options: GlobalOptions) -> Self {
        Self { options }
    }

    pub fn is_json(&self) -> bool {
        self.options.output_format == OutputFormat::Json
    }

    /// Display data according to the configured output format
    pub fn display<T>(&self, data: &T) -> Result<()>
    where
        T: Serialize + TableDisplay,
    {
        if self.options.quiet {
            return Ok(());
        }

        match self.options.output_format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                println!("{json}");
            }
            OutputFormat::Table => {
                let table = data.to_table(&self.options);
                println!("{table}");
            }
            OutputFormat::Compact => {
                println!("{}", data.to_compact());
            }
        }
        Ok(())
    }

    fn status(&self, icon: &str, color: Color, message: &str) -> String {
        if self.options.no_color {
            format!("{icon} {message}")
        } else {
            format!("{} {}", icon.color(color), message.color(color))
        }
    }

    /// Quiet and JSON modes keep stdout machine-readable.
    fn chatty(&self) -> bool {
        !self.options.quiet && !self.is_json()
    }

    pub fn success(&self, message: &str) {
        if self.chatty() {
            println!("{}", self.status(ICONS.success, THEME.success, message));
        }
    }

    /// Errors always go to stderr, even in quiet mode.
    pub fn error(&self, message: &str) {
        eprintln!("{}", self.status(ICONS.error, THEME.error, message));
    }

    pub fn warning(&self, message: &str) {
        if self.chatty() {
            println!("{}", self.status(ICONS.warning, THEME.warning, message));
        }
    }

    /// Diagnostics behind `--verbose`, written to stderr.
    pub fn verbose(&self, message: &str) {
        if self.options.verbose && !self.options.quiet {
            eprintln!("{}", self.status(ICONS.arrow, THEME.muted, message));
        }
    }

    pub fn info(&self, message: &str) {
        if self.chatty() {
            println!("{}", self.status(ICONS.info, THEME.info, message));
        }
    }

    pub fn heading(&self, text: &str) {
        if self.chatty() {
            let output = if self.options.no_color {
                format!("\n{text}\n{}", "=".repeat(text.len()))
            } else {
                format!("\n{}", text.color(THEME.primary).bold())
            };
            println!("{output}");
        }
    }

    pub fn key_value(&self, key: &str, value: &str) {
        if self.chatty() {
            let output = if self.options.no_color {
                format!("{key}: {value}")
            } else {
                format!("{}: {}", key.color(THEME.key).bold(), value.color(THEME.value))
            };
            println!("{output}");
        }
    }

    /// Overwritable status line; pair with [`clear_line`](Self::clear_line).
    pub fn progress(&self, message: &str) {
        if self.chatty() {
            print!("\r{}...", self.status(ICONS.loading, THEME.highlight, message));
            std::io::stdout().flush().ok();
        }
    }

    pub fn clear_line(&self) {
        if self.chatty() {
            print!("\r{:width$}\r", "", width = 80);
            std::io::stdout().flush().ok();
        }
    }
}

fn paint(cell: Cell, color: Color, options: &GlobalOptions) -> Cell {
    if options.no_color { cell } else { cell.fg(table_color(color)) }
}

/// Bold headers over an ASCII grid, or a condensed UTF-8 one when colour is on.
pub fn themed_table(options: &GlobalOptions, headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(if options.no_color {
        comfy_table::presets::ASCII_FULL
    } else {
        comfy_table::presets::UTF8_FULL_CONDENSED
    });
    table.set_header(
        headers
            .iter()
            .map(|header| paint(Cell::new(header).add_attribute(Attribute::Bold), THEME.highlight, options)),
    );
    table
}

fn change_cell(change: Change, options: &GlobalOptions) -> Cell {
    let (label, color) = match change {
        Change::Created => ("created", THEME.created),
        Change::Updated => ("updated", THEME.updated),
        Change::Deleted => ("deleted", THEME.deleted),
    };
    paint(Cell::new(label), color, options)
}

impl TableDisplay for CommitReceipt {
    fn to_table(&self, options: &GlobalOptions) -> Table {
        let mut table = themed_table(options, &["Path", "Kind", "Id", "Change"]);
        for record in &self.records {
            table.add_row(vec![
                Cell::new(&record.path),
                Cell::new(&record.kind),
                Cell::new(&record.id),
                change_cell(record.change, options),
            ]);
        }
        table
    }

    fn to_compact(&self) -> String {
        let count = |change: Change| self.records.iter().filter(|record| record.change == change).count();
        format!(
            "{}/{} created={} updated={} deleted={} passes={}",
            self.root.kind,
            self.root.id,
            count(Change::Created),
            count(Change::Updated),
            count(Change::Deleted),
            self.passes
        )
    }
}

/// Issues reported by a failed commit.
#[derive(Debug, Serialize)]
pub struct IssueReport {
    pub issues: Vec<GraphIssue>,
}

impl TableDisplay for IssueReport {
    fn to_table(&self, options: &GlobalOptions) -> Table {
        let mut table = themed_table(options, &["Path", "Kind", "Message"]);
        for issue in &self.issues {
            table.add_row(vec![
                Cell::new(&issue.path),
                Cell::new(issue.kind.to_string()),
                Cell::new(&issue.message),
            ]);
        }
        table
    }

    fn to_compact(&self) -> String {
        self.issues
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}
