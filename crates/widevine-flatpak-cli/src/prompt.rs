use std::io::{self, BufRead, IsTerminal, Write};

use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    Proceed,
    Cancel,
}

/// Blocking yes/no gate in front of a pipeline step.
pub(crate) trait Confirm {
    fn confirm(&self, prompt: &str) -> Result<Decision>;
}

/// Waits for any key press on a terminal, or for a line when stdin is piped.
pub(crate) struct TerminalPrompt;

impl Confirm for TerminalPrompt {
    fn confirm(&self, prompt: &str) -> Result<Decision> {
        print!("{prompt} ");
        io::stdout().flush().context("failed to flush prompt")?;

        if io::stdin().is_terminal() {
            read_key_decision()
        } else {
            let mut line = String::new();
            let read = io::stdin()
                .lock()
                .read_line(&mut line)
                .context("failed to read confirmation from stdin")?;
            println!();
            Ok(decision_for_line(read))
        }
    }
}

fn read_key_decision() -> Result<Decision> {
    terminal::enable_raw_mode().context("failed to switch terminal to raw mode")?;
    let decision: Result<Decision> = loop {
        match event::read() {
            Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => {
                break Ok(decision_for_key(&key));
            }
            Ok(_) => continue,
            Err(err) => break Err(err).context("failed to read key press"),
        }
    };
    let restored = terminal::disable_raw_mode().context("failed to restore terminal mode");
    println!();
    let decision = decision?;
    restored?;
    Ok(decision)
}

/// Raw mode swallows SIGINT, so Ctrl-C arrives here as a key.
pub(crate) fn decision_for_key(key: &KeyEvent) -> Decision {
    match key.code {
        KeyCode::Esc => Decision::Cancel,
        KeyCode::Char('c') | KeyCode::Char('d')
            if key.modifiers.contains(KeyModifiers::CONTROL) =>
        {
            Decision::Cancel
        }
        _ => Decision::Proceed,
    }
}

/// Zero bytes means stdin hit EOF before the user answered.
pub(crate) fn decision_for_line(bytes_read: usize) -> Decision {
    if bytes_read == 0 {
        Decision::Cancel
    } else {
        Decision::Proceed
    }
}
