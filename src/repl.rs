use anyhow::Context;
use reedline::{
    FileBackedHistory, Prompt, PromptEditMode, PromptHistorySearch, PromptHistorySearchStatus,
    Reedline, Signal,
};
use std::borrow::Cow;
use tracing::{debug, warn};

use crate::config::Config;
use crate::interp::Interpreter;
use crate::pipeline::Compiled;

/// Prompt showing the primary or the continuation string
struct MoonPrompt {
    primary: String,
    continuation: String,
    is_continuation: bool,
}

impl MoonPrompt {
    fn new(config: &Config) -> Self {
        Self {
            primary: config.prompt.clone(),
            continuation: config.continuation_prompt.clone(),
            is_continuation: false,
        }
    }
}

impl Prompt for MoonPrompt {
    fn render_prompt_left(&self) -> Cow<'_, str> {
        // Use ANSI reset code to ensure white/default terminal color
        if self.is_continuation {
            Cow::Owned(format!("\x1b[0m{}", self.continuation))
        } else {
            Cow::Owned(format!("\x1b[0m{}", self.primary))
        }
    }

    fn render_prompt_right(&self) -> Cow<'_, str> {
        Cow::Borrowed("")
    }

    fn render_prompt_indicator(&self, _mode: PromptEditMode) -> Cow<'_, str> {
        Cow::Borrowed("")
    }

    fn render_prompt_multiline_indicator(&self) -> Cow<'_, str> {
        Cow::Borrowed("")
    }

    fn render_prompt_history_search_indicator(
        &self,
        history_search: PromptHistorySearch,
    ) -> Cow<'_, str> {
        let prefix = match history_search.status {
            PromptHistorySearchStatus::Passing => "",
            PromptHistorySearchStatus::Failing => "failing ",
        };
        Cow::Owned(format!("({}reverse search) ", prefix))
    }
}

/// Version banner printed when the interactive loop starts
pub fn banner() -> String {
    format!(
        "moon {} (Lua 5.4)\nPress Ctrl+C to stop a running script, Ctrl+D to quit",
        env!("CARGO_PKG_VERSION")
    )
}

fn line_editor(config: &Config) -> Reedline {
    let editor = Reedline::create();
    let Some(path) = config.history_path() else {
        return editor;
    };
    match FileBackedHistory::with_file(config.history_size, path.clone()) {
        Ok(history) => {
            debug!(path = %path.display(), "using history file");
            editor.with_history(Box::new(history))
        }
        Err(err) => {
            warn!(path = %path.display(), %err, "history disabled");
            editor
        }
    }
}

/// Interactive loop: read a statement (possibly over several lines), run
/// it, report failures and keep going until Ctrl+D
pub fn run(interp: &Interpreter, config: &Config) -> anyhow::Result<()> {
    let mut line_editor = line_editor(config);
    let mut prompt = MoonPrompt::new(config);
    let mut buffer = String::new();

    println!("{}", banner());

    loop {
        prompt.is_continuation = !buffer.is_empty();

        let sig = line_editor.read_line(&prompt);

        match sig {
            Ok(Signal::Success(line)) => {
                // Append line to buffer
                if !buffer.is_empty() {
                    buffer.push('\n');
                }
                buffer.push_str(&line);

                // Skip empty statements
                if buffer.trim().is_empty() {
                    buffer.clear();
                    continue;
                }

                match interp.compile_line(&buffer) {
                    Compiled::Incomplete => continue,
                    compiled => {
                        interp.run_compiled(compiled);
                    }
                }
                buffer.clear();
            }
            Ok(Signal::CtrlC) => {
                println!("^C");
                buffer.clear();
                continue;
            }
            Ok(Signal::CtrlD) => {
                println!();
                break;
            }
            Err(err) => {
                return Err(err).context("reading interactive input");
            }
        }
    }

    Ok(())
}
