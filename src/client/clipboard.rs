//! Clipboard access for copy and paste

use thiserror::Error;
use tracing::debug;

/// Errors that can occur during clipboard operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClipboardError {
    #[error("Clipboard unavailable: {0}")]
    Unavailable(String),
    #[error("Clipboard is empty")]
    Empty,
    #[error("Clipboard access failed: {0}")]
    Access(String),
}

/// Result type for clipboard operations
pub type ClipboardResult<T> = Result<T, ClipboardError>;

pub trait Clipboard: Send {
    fn get_text(&mut self) -> ClipboardResult<String>;
    fn set_text(&mut self, text: &str) -> ClipboardResult<()>;
}

/// The desktop clipboard
///
/// Opened on first use and held afterwards; on X11 the owner has to stay
/// alive for other applications to paste what was copied.
#[derive(Default)]
pub struct SystemClipboard {
    inner: Option<arboard::Clipboard>,
}

impl SystemClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&mut self) -> ClipboardResult<&mut arboard::Clipboard> {
        if self.inner.is_none() {
            let clipboard = arboard::Clipboard::new().map_err(|e| {
                debug!("arboard clipboard init failed: {}", e);
                ClipboardError::Unavailable(e.to_string())
            })?;
            self.inner = Some(clipboard);
        }
        self.inner
            .as_mut()
            .ok_or_else(|| ClipboardError::Unavailable("not initialized".to_string()))
    }
}

impl Clipboard for SystemClipboard {
    fn get_text(&mut self) -> ClipboardResult<String> {
        match self.handle()?.get_text() {
            Ok(text) if text.is_empty() => Err(ClipboardError::Empty),
            Ok(text) => Ok(text),
            Err(arboard::Error::ContentNotAvailable) => Err(ClipboardError::Empty),
            Err(e) => Err(ClipboardError::Access(e.to_string())),
        }
    }

    fn set_text(&mut self, text: &str) -> ClipboardResult<()> {
        self.handle()?
            .set_text(text.to_string())
            .map_err(|e| ClipboardError::Access(e.to_string()))?;
        debug!("Copied {} bytes to clipboard", text.len());
        Ok(())
    }
}
