//! Built-in terminal color themes, served to the browser emulator.
//!
//! Field names follow the xterm.js `ITheme` shape so the client can pass the
//! JSON object straight through.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TermTheme {
    pub background: &'static str,
    pub foreground: &'static str,
    pub cursor: &'static str,
    pub cursor_accent: &'static str,
    pub selection_background: &'static str,
    pub black: &'static str,
    pub red: &'static str,
    pub green: &'static str,
    pub yellow: &'static str,
    pub blue: &'static str,
    pub magenta: &'static str,
    pub cyan: &'static str,
    pub white: &'static str,
    pub bright_black: &'static str,
    pub bright_red: &'static str,
    pub bright_green: &'static str,
    pub bright_yellow: &'static str,
    pub bright_blue: &'static str,
    pub bright_magenta: &'static str,
    pub bright_cyan: &'static str,
    pub bright_white: &'static str,
}

pub fn names() -> &'static [&'static str] {
    &["default", "dracula", "nord", "solarized-dark"]
}

pub fn get(name: &str) -> Option<TermTheme> {
    match name {
        "default" => Some(TermTheme {
            background: "#000000",
            foreground: "#ffffff",
            cursor: "#ffffff",
            cursor_accent: "#000000",
            selection_background: "#ffffff4d",
            black: "#000000",
            red: "#cd3131",
            green: "#0dbc79",
            yellow: "#e5e510",
            blue: "#2472c8",
            magenta: "#bc3fbc",
            cyan: "#11a8cd",
            white: "#e5e5e5",
            bright_black: "#666666",
            bright_red: "#f14c4c",
            bright_green: "#23d18b",
            bright_yellow: "#f5f543",
            bright_blue: "#3b8eea",
            bright_magenta: "#d670d6",
            bright_cyan: "#29b8db",
            bright_white: "#ffffff",
        }),
        "dracula" => Some(TermTheme {
            background: "#282a36",
            foreground: "#f8f8f2",
            cursor: "#f8f8f2",
            cursor_accent: "#282a36",
            selection_background: "#44475a",
            black: "#21222c",
            red: "#ff5555",
            green: "#50fa7b",
            yellow: "#f1fa8c",
            blue: "#bd93f9",
            magenta: "#ff79c6",
            cyan: "#8be9fd",
            white: "#f8f8f2",
            bright_black: "#6272a4",
            bright_red: "#ff6e6e",
            bright_green: "#69ff94",
            bright_yellow: "#ffffa5",
            bright_blue: "#d6acff",
            bright_magenta: "#ff92df",
            bright_cyan: "#a4ffff",
            bright_white: "#ffffff",
        }),
        "nord" => Some(TermTheme {
            background: "#2e3440",
            foreground: "#d8dee9",
            cursor: "#d8dee9",
            cursor_accent: "#2e3440",
            selection_background: "#434c5e",
            black: "#3b4252",
            red: "#bf616a",
            green: "#a3be8c",
            yellow: "#ebcb8b",
            blue: "#81a1c1",
            magenta: "#b48ead",
            cyan: "#88c0d0",
            white: "#e5e9f0",
            bright_black: "#4c566a",
            bright_red: "#bf616a",
            bright_green: "#a3be8c",
            bright_yellow: "#ebcb8b",
            bright_blue: "#81a1c1",
            bright_magenta: "#b48ead",
            bright_cyan: "#8fbcbb",
            bright_white: "#eceff4",
        }),
        "solarized-dark" => Some(TermTheme {
            background: "#002b36",
            foreground: "#839496",
            cursor: "#839496",
            cursor_accent: "#002b36",
            selection_background: "#073642",
            black: "#073642",
            red: "#dc322f",
            green: "#859900",
            yellow: "#b58900",
            blue: "#268bd2",
            magenta: "#d33682",
            cyan: "#2aa198",
            white: "#eee8d5",
            bright_black: "#586e75",
            bright_red: "#cb4b16",
            bright_green: "#586e75",
            bright_yellow: "#657b83",
            bright_blue: "#839496",
            bright_magenta: "#6c71c4",
            bright_cyan: "#93a1a1",
            bright_white: "#fdf6e3",
        }),
        _ => None,
    }
}
