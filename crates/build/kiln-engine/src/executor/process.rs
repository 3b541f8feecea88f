//! Spawning one action's process.

use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::{debug, info};

use super::{ActionOutcome, LineSink};
use crate::action::{Action, ActionId};

/// Everything a worker needs to run one action, detached from the graph.
#[derive(Debug, Clone)]
pub(crate) struct Job {
    pub id: ActionId,
    pub program: PathBuf,
    pub arguments: String,
    pub working_dir: PathBuf,
}

impl Job {
    pub fn from_action(action: &Action) -> Self {
        Self {
            id: action.id,
            program: action.program.clone(),
            arguments: action.arguments.clone(),
            working_dir: action.working_dir.clone(),
        }
    }

    /// Run the process to completion, forwarding its output line by line.
    pub fn run(&self, sink: Option<&LineSink>) -> ActionOutcome {
        let program = expand_env(&self.program.to_string_lossy());
        let arguments = split_arguments(&expand_env(&self.arguments));
        debug!(action = %self.id, %program, ?arguments, "spawning");

        let mut child = match Command::new(&program)
            .args(&arguments)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return ActionOutcome::LaunchFailed {
                    reason: format!("{program}: {e}"),
                };
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        std::thread::scope(|s| {
            if let Some(stderr) = stderr {
                s.spawn(|| self.forward(stderr, sink));
            }
            if let Some(stdout) = stdout {
                self.forward(stdout, sink);
            }
        });

        match child.wait() {
            Ok(status) if status.success() => ActionOutcome::Succeeded,
            Ok(status) => ActionOutcome::Failed {
                exit_code: status.code(),
            },
            Err(e) => ActionOutcome::LaunchFailed {
                reason: format!("{program}: {e}"),
            },
        }
    }

    fn forward(&self, stream: impl Read, sink: Option<&LineSink>) {
        for line in BufReader::new(stream).lines() {
            let Ok(line) = line else { break };
            match sink {
                Some(sink) => sink(self.id, &line),
                None => info!(target: "kiln::output", "{line}"),
            }
        }
    }
}

/// Expand `$VAR` and `${VAR}` from the process environment. Unknown
/// variables are left as written.
fn expand_env(input: &str) -> String {
    shellexpand::env_with_context_no_errors(input, |var: &str| std::env::var(var).ok()).into_owned()
}

/// Split an argument string into arguments.
///
/// Whitespace separates arguments. Double or single quotes group text and are
/// removed; inside double quotes `\"` and `\\` are escapes. Outside quotes a
/// backslash only escapes a following space.
pub fn split_arguments(s: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut chars = s.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' => {
                in_arg = true;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => break,
                        '\\' if matches!(chars.peek(), Some('"' | '\\')) => {
                            if let Some(escaped) = chars.next() {
                                current.push(escaped);
                            }
                        }
                        _ => current.push(c),
                    }
                }
            }
            '\'' => {
                in_arg = true;
                for c in chars.by_ref() {
                    if c == '\'' {
                        break;
                    }
                    current.push(c);
                }
            }
            '\\' if chars.peek() == Some(&' ') => {
                in_arg = true;
                current.push(' ');
                chars.next();
            }
            c if c.is_whitespace() => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            c => {
                in_arg = true;
                current.push(c);
            }
        }
    }

    if in_arg {
        args.push(current);
    }
    args
}
