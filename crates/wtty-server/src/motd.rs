//! Message-of-the-day banner shown once to the client that opens a session.
//!
//! Configurable through `motd_art`: the built-in art, "none", or a path to a
//! custom file (which may contain ANSI escapes).

use std::path::Path;

use crate::config::Settings;

const BLUE: &str = "\x1b[34m";
const BRIGHT_WHITE: &str = "\x1b[97m";
const YELLOW: &str = "\x1b[33m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

fn builtin_art() -> String {
    format!(
        "{BLUE}\
   __        __  __
   \\ \\  /\\  / / |  |_  |  |_  \\   /
    \\ \\/  \\/ /  |   _| |   _|  \\ /
     \\__/\\__/    \\__|   \\__|    |    {RESET}wtty {YELLOW}v{}{RESET}
{BLUE}                               /{RESET}
",
        env!("CARGO_PKG_VERSION")
    )
}

fn load_art(motd_art: &str) -> String {
    match motd_art {
        "none" => String::new(),
        "default" => builtin_art(),
        path => match std::fs::read_to_string(Path::new(path)) {
            Ok(contents) => contents,
            Err(_) => builtin_art(),
        },
    }
}

/// Render the banner bytes for a fresh session. Newlines become `\r\n`
/// because the client renders this as raw terminal output.
pub fn render(settings: &Settings, remote_addr: &str) -> Vec<u8> {
    let art = load_art(&settings.motd_art);
    if art.is_empty() && settings.motd_art == "none" {
        return Vec::new();
    }

    let secure = !settings.unsecure;
    let proto = if secure { "https" } else { "http" };
    let color = if secure { GREEN } else { RED };
    let mode = if secure { "secure" } else { "UNSECURE" };

    let mut lines: Vec<String> = Vec::new();
    if !art.is_empty() {
        lines.push(art.replace("\r\n", "\n").replace('\n', "\r\n"));
    }
    lines.push(format!(
        "  {BRIGHT_WHITE}Listening on:{RESET}  {color}{proto}://{}:{}{RESET}",
        settings.host, settings.port
    ));
    if !remote_addr.is_empty() {
        lines.push(format!("  {BRIGHT_WHITE}Connected from:{RESET} {color}{remote_addr}{RESET}"));
    }
    lines.push(format!("  {BRIGHT_WHITE}Mode:{RESET}           {color}{mode}{RESET}"));
    lines.push(String::new());
    if !secure {
        lines.push(format!("  {RED}/!\\ This session is UNSECURE.{RESET}"));
        lines.push(String::new());
    }
    lines.push(String::new());

    lines.join("\r\n").into_bytes()
}
