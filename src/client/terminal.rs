//! Terminal view
//!
//! The session client renders into a [`TerminalView`]. [`EmulatorView`] keeps
//! a `vt100` screen so the client can answer size, selection and copy
//! requests, and can mirror the raw stream to a real terminal.

use std::io::Write;

use crossterm::terminal::SetTitle;
use tracing::debug;

use crate::protocol::{MAX_TERMINAL_COLS, MAX_TERMINAL_ROWS};

/// Lines of scrollback kept by the emulator
const SCROLLBACK_LINES: usize = 1000;

/// Where the session client renders
pub trait TerminalView: Send {
    /// Write process output verbatim
    fn write(&mut self, data: &str);

    /// Show which project the session is attached to
    fn annotate(&mut self, project_name: &str, project_path: &str, reattached: bool);

    /// Render a status line inline, outside the process's output
    fn notice(&mut self, message: &str);

    /// Current size as (cols, rows)
    fn size(&self) -> (u16, u16);

    fn resize(&mut self, cols: u16, rows: u16);

    /// Text the user has selected, if any
    fn selection(&self) -> Option<String>;

    /// The last `count` non-empty rendered lines, oldest first
    fn last_lines(&self, count: usize) -> Vec<String>;
}

/// A `vt100` screen, optionally mirrored to a real terminal
pub struct EmulatorView {
    parser: vt100::Parser,
    mirror: Option<Box<dyn Write + Send>>,
    selection: Option<String>,
    title: Option<String>,
}

impl EmulatorView {
    pub fn new(cols: u16, rows: u16) -> Self {
        let (cols, rows) = clamp_size(cols, rows);
        Self {
            parser: vt100::Parser::new(rows, cols, SCROLLBACK_LINES),
            mirror: None,
            selection: None,
            title: None,
        }
    }

    /// Also write everything to `out`
    pub fn with_mirror(mut self, out: Box<dyn Write + Send>) -> Self {
        self.mirror = Some(out);
        self
    }

    pub fn set_selection(&mut self, text: Option<String>) {
        self.selection = text.filter(|t| !t.is_empty());
    }

    /// Window title set from the attached project
    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    /// Visible screen contents as plain text
    pub fn contents(&self) -> String {
        self.parser.screen().contents()
    }

    fn emit(&mut self, data: &str) {
        self.parser.process(data.as_bytes());
        if let Some(out) = self.mirror.as_mut() {
            if let Err(e) = out.write_all(data.as_bytes()).and_then(|_| out.flush()) {
                debug!("Terminal mirror write failed: {}", e);
            }
        }
    }
}

impl TerminalView for EmulatorView {
    fn write(&mut self, data: &str) {
        self.emit(data);
    }

    fn annotate(&mut self, project_name: &str, project_path: &str, reattached: bool) {
        let title = format!("{} ({})", project_name, project_path);
        if let Some(out) = self.mirror.as_mut() {
            let _ = crossterm::execute!(out, SetTitle(&title));
        }
        self.title = Some(title);

        let verb = if reattached { "Reattached to" } else { "Attached to" };
        self.notice(&format!("{} {} at {}", verb, project_name, project_path));
    }

    fn notice(&mut self, message: &str) {
        self.emit(&format!("\r\n\x1b[2m[devhub] {}\x1b[0m\r\n", message));
    }

    fn size(&self) -> (u16, u16) {
        let (rows, cols) = self.parser.screen().size();
        (cols, rows)
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        let (cols, rows) = clamp_size(cols, rows);
        self.parser.set_size(rows, cols);
    }

    fn selection(&self) -> Option<String> {
        self.selection.clone()
    }

    fn last_lines(&self, count: usize) -> Vec<String> {
        let screen = self.parser.screen();
        let (_, cols) = screen.size();
        let mut lines: Vec<String> = screen
            .rows(0, cols)
            .map(|line| line.trim_end().to_string())
            .collect();

        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        let start = lines.len().saturating_sub(count);
        lines.split_off(start)
    }
}

fn clamp_size(cols: u16, rows: u16) -> (u16, u16) {
    (cols.clamp(1, MAX_TERMINAL_COLS), rows.clamp(1, MAX_TERMINAL_ROWS))
}
