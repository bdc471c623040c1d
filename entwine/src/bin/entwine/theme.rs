//! Colours and glyphs shared by every command.

use colored::Color;
use comfy_table::Color as TableColor;
use once_cell::sync::Lazy;

pub struct Palette {
    pub success: Color,
    pub error: Color,
    pub warning: Color,
    pub info: Color,
    pub highlight: Color,
    pub muted: Color,
    pub primary: Color,
    pub secondary: Color,
    pub key: Color,
    pub value: Color,
    /// Receipt rows, by change kind.
    pub created: Color,
    pub updated: Color,
    pub deleted: Color,
}

impl Palette {
    fn standard() -> Self {
        Self {
            success: Color::Green,
            error: Color::Red,
            warning: Color::Yellow,
            info: Color::Blue,
            highlight: Color::Cyan,
            muted: Color::BrightBlack,
            primary: Color::BrightBlue,
            secondary: Color::Magenta,
            key: Color::BrightCyan,
            value: Color::White,
            created: Color::BrightGreen,
            updated: Color::BrightYellow,
            deleted: Color::BrightRed,
        }
    }
}

pub static THEME: Lazy<Palette> = Lazy::new(Palette::standard);

pub struct Glyphs {
    pub success: &'static str,
    pub error: &'static str,
    pub warning: &'static str,
    pub info: &'static str,
    pub arrow: &'static str,
    pub loading: &'static str,
}

pub const ICONS: Glyphs = Glyphs {
    success: "✓",
    error: "✗",
    warning: "⚠",
    info: "ℹ",
    arrow: "→",
    loading: "⟳",
};

/// The same palette entry for comfy-table cells.
pub fn table_color(color: Color) -> TableColor {
    match color {
        Color::Black => TableColor::Black,
        Color::Red => TableColor::DarkRed,
        Color::Green => TableColor::DarkGreen,
        Color::Yellow => TableColor::DarkYellow,
        Color::Blue => TableColor::DarkBlue,
        Color::Magenta => TableColor::DarkMagenta,
        Color::Cyan => TableColor::DarkCyan,
        Color::White => TableColor::Grey,
        Color::BrightBlack => TableColor::DarkGrey,
        Color::BrightRed => TableColor::Red,
        Color::BrightGreen => TableColor::Green,
        Color::BrightYellow => TableColor::Yellow,
        Color::BrightBlue => TableColor::Blue,
        Color::BrightMagenta => TableColor::Magenta,
        Color::BrightCyan => TableColor::Cyan,
        Color::BrightWhite => TableColor::White,
        Color::TrueColor { r, g, b } => TableColor::Rgb { r, g, b },
    }
}
