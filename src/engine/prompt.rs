use declarative::ConfirmCallback;
use dialoguer::Confirm;
use std::io;

/// Asks on the terminal; destructive prompts default to no
pub struct TerminalConfirm {
    default: bool,
}

impl TerminalConfirm {
    pub fn new(default: bool) -> Self {
        Self { default }
    }
}

impl ConfirmCallback for TerminalConfirm {
    fn confirm(&mut self, prompt: &str) -> io::Result<bool> {
        Confirm::new()
            .with_prompt(prompt)
            .default(self.default)
            .interact()
            .map_err(|e| io::Error::other(e.to_string()))
    }
}
