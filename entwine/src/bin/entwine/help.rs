//! Long-help appendices and clap styling drawn from the shared palette.

use clap::{
    ColorChoice, Command, CommandFactory,
    builder::{
        Styles,
        styling::{AnsiColor, Color as ClapColor, RgbColor, Style},
    },
};
use colored::{Color, Colorize, control::ShouldColorize};
use std::fmt::Write;

use crate::Cli;
use crate::commands::{commit, schema};
use crate::theme::{ICONS, THEME};

/// A titled set of invocations shown under a subcommand's `--help`.
#[derive(Clone, Copy)]
pub struct ExampleGroup {
    pub title: &'static str,
    pub commands: &'static [&'static str],
}

const ENVIRONMENT: &[(&str, &str)] = &[
    ("REDIS_URL", "Redis connection URL used when entwine.toml does not set one"),
    ("RUST_LOG", "Log filter, e.g. entwine=debug to trace deferred resolution"),
];

struct Painter {
    enabled: bool,
}

impl Painter {
    fn plain(&self, text: &str, color: Color) -> String {
        if self.enabled { text.color(color).to_string() } else { text.to_string() }
    }

    fn bold(&self, text: &str, color: Color) -> String {
        if self.enabled { text.color(color).bold().to_string() } else { text.to_string() }
    }
}

/// The full clap command with environment notes and per-subcommand examples attached.
pub fn command() -> Command {
    let painter = Painter { enabled: ShouldColorize::from_env().should_colorize() };
    let choice = if painter.enabled { ColorChoice::Auto } else { ColorChoice::Never };

    let examples: [(&str, &[ExampleGroup]); 2] = [("schema", schema::EXAMPLES), ("commit", commit::EXAMPLES)];
    let mut command = Cli::command()
        .color(choice)
        .styles(styles())
        .after_long_help(appendix(&painter));
    for (name, groups) in examples {
        command = command.mut_subcommand(name, |sub| sub.after_long_help(example_text(groups, &painter)));
    }
    command
}

fn example_text(groups: &[ExampleGroup], painter: &Painter) -> String {
    let mut text = format!("{}\n", painter.bold("Examples:", THEME.highlight));
    let arrow = painter.plain(ICONS.arrow, THEME.secondary);
    for (index, group) in groups.iter().enumerate() {
        if index > 0 {
            text.push('\n');
        }
        let _ = writeln!(text, "  {}", painter.bold(group.title, THEME.primary));
        for line in group.commands {
            let _ = writeln!(text, "    {arrow} {}", painter.plain(line, THEME.secondary));
        }
    }
    text
}

fn appendix(painter: &Painter) -> String {
    let mut text = format!("{}\n", painter.bold("Environment Variables:", THEME.highlight));
    for (name, meaning) in ENVIRONMENT {
        let _ = writeln!(text, "  {}  {}", painter.bold(name, THEME.key), painter.plain(meaning, THEME.value));
    }
    let _ = writeln!(
        text,
        "\n{} {}",
        painter.bold("Tip:", THEME.highlight),
        painter.plain("Use 'entwine <command> --help' to view examples for each command.", THEME.secondary)
    );
    text
}

fn styles() -> Styles {
    let style = |color: Color| Style::new().fg_color(Some(clap_color(color)));
    Styles::styled()
        .usage(style(THEME.primary).bold())
        .header(style(THEME.highlight).bold())
        .literal(style(THEME.secondary))
        .placeholder(style(THEME.muted))
        .valid(style(THEME.success))
        .invalid(style(THEME.warning))
        .error(style(THEME.error).bold())
}

fn clap_color(color: Color) -> ClapColor {
    use AnsiColor::*;

    let ansi = match color {
        Color::TrueColor { r, g, b } => return ClapColor::Rgb(RgbColor(r, g, b)),
        Color::Black => Black,
        Color::Red => Red,
        Color::Green => Green,
        Color::Yellow => Yellow,
        Color::Blue => Blue,
        Color::Magenta => Magenta,
        Color::Cyan => Cyan,
        Color::White => White,
        Color::BrightBlack => BrightBlack,
        Color::BrightRed => BrightRed,
        Color::BrightGreen => BrightGreen,
        Color::BrightYellow => BrightYellow,
        Color::BrightBlue => BrightBlue,
        Color::BrightMagenta => BrightMagenta,
        Color::BrightCyan => BrightCyan,
        Color::BrightWhite => BrightWhite,
    };
    ClapColor::Ansi(ansi)
}
