//! Hook runner: fires named external shell actions at lifecycle points.
//! An insertion-ordered map from hook name to a queue of resolved
//! command invocations, built from the user's `commands` configuration
//! (`hook_name -> command(s)`), with `{kwarg}`-style argv templating.

use std::collections::HashMap;
use std::process::Command;

use tracing::{info, warn};

/// One or more shell commands configured for a hook name.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum HookCommand {
    Single(String),
    Many(Vec<String>),
}

struct Invocation {
    args: Vec<String>,
}

/// Ordered queue of resolved hook invocations, preserving insertion order
/// across names and allowing repeated `add` calls to append within one
/// name (matches `OrderedDict`-backed storage in the original).
pub struct Hooks {
    commands: HashMap<String, HookCommand>,
    queue: Vec<(String, Vec<Invocation>)>,
}

impl Hooks {
    pub fn new(commands: HashMap<String, HookCommand>) -> Self {
        Hooks {
            commands,
            queue: Vec::new(),
        }
    }

    /// Look up the configured command(s) for `hook_name`, tokenise, and
    /// substitute `{key}` placeholders from `kwargs`. Unknown
    /// substitution keys are logged as a warning and that one command is
    /// skipped entirely, never aborting the caller.
    pub fn add(&mut self, hook_name: &str, kwargs: &[(&str, &str)]) {
        let Some(command) = self.commands.get(hook_name) else {
            return;
        };
        let templates: Vec<String> = match command {
            HookCommand::Single(s) => vec![s.clone()],
            HookCommand::Many(v) => v.clone(),
        };
        if templates.is_empty() {
            return;
        }

        let slot = match self.queue.iter_mut().find(|(name, _)| name == hook_name) {
            Some((_, invocations)) => invocations,
            None => {
                self.queue.push((hook_name.to_string(), Vec::new()));
                &mut self.queue.last_mut().unwrap().1
            }
        };

        for template in templates {
            let tokens = match shell_words::split(&template) {
                Ok(tokens) => tokens,
                Err(e) => {
                    warn!(hook = hook_name, error = %e, "invalid hook command");
                    continue;
                }
            };
            match substitute(&tokens, kwargs) {
                Ok(args) => slot.push(Invocation { args }),
                Err(key) => {
                    warn!(hook = hook_name, key, "unknown substitution key in hook, skipping");
                }
            }
        }
    }

    /// Execute every queued invocation synchronously in insertion order,
    /// capturing combined stdout/stderr. A non-zero exit is logged as a
    /// warning; execution continues with the next hook. The queue is
    /// emptied afterwards regardless of outcome.
    pub fn call(&mut self) {
        for (hook_name, invocations) in self.queue.drain(..) {
            for invocation in invocations {
                info!(hook = %hook_name, args = ?invocation.args, "calling hook");
                let Some((program, rest)) = invocation.args.split_first() else {
                    continue;
                };
                match Command::new(program)
                    .args(rest)
                    .stdout(std::process::Stdio::piped())
                    .stderr(std::process::Stdio::piped())
                    .output()
                {
                    Ok(output) => {
                        if !output.status.success() {
                            warn!(
                                hook = %hook_name,
                                code = output.status.code(),
                                stdout = %String::from_utf8_lossy(&output.stdout),
                                stderr = %String::from_utf8_lossy(&output.stderr),
                                "hook returned a non-zero exit code"
                            );
                        }
                    }
                    Err(e) => {
                        warn!(hook = %hook_name, args = ?invocation.args, error = %e, "failed to call hook");
                    }
                }
            }
        }
    }
}

/// Substitute `{key}` placeholders in each token. Returns the first
/// unknown key encountered, if any, so the caller can skip that command.
fn substitute(tokens: &[String], kwargs: &[(&str, &str)]) -> Result<Vec<String>, String> {
    let mut out = Vec::with_capacity(tokens.len());
    for token in tokens {
        out.push(substitute_one(token, kwargs)?);
    }
    Ok(out)
}

fn substitute_one(token: &str, kwargs: &[(&str, &str)]) -> Result<String, String> {
    let mut result = String::with_capacity(token.len());
    let mut chars = token.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c != '{' {
            result.push(c);
            continue;
        }
        let Some(end) = token[i..].find('}') else {
            result.push(c);
            continue;
        };
        let key = &token[i + 1..i + end];
        match kwargs.iter().find(|(k, _)| *k == key) {
            Some((_, v)) => result.push_str(v),
            None => return Err(key.to_string()),
        }
        // Skip past the consumed `{key}` characters.
        for _ in 0..end {
            chars.next();
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commands() -> HashMap<String, HookCommand> {
        let mut m = HashMap::new();
        m.insert(
            "set_http_challenge".to_string(),
            HookCommand::Single("echo {domain} {file}".to_string()),
        );
        m.insert(
            "unconfigured".to_string(),
            HookCommand::Many(vec![]),
        );
        m
    }

    #[test]
    fn add_substitutes_known_keys() {
        let mut hooks = Hooks::new(commands());
        hooks.add("set_http_challenge", &[("domain", "example.com"), ("file", "/tmp/x")]);
        assert_eq!(hooks.queue.len(), 1);
        assert_eq!(hooks.queue[0].1[0].args, vec!["echo", "example.com", "/tmp/x"]);
    }

    #[test]
    fn add_skips_unknown_keys_without_panicking() {
        let mut hooks = Hooks::new(commands());
        hooks.add("set_http_challenge", &[("domain", "example.com")]);
        assert!(hooks.queue.is_empty() || hooks.queue[0].1.is_empty());
    }

    #[test]
    fn add_is_noop_for_empty_command_list() {
        let mut hooks = Hooks::new(commands());
        hooks.add("unconfigured", &[]);
        assert!(hooks.queue.is_empty());
    }

    #[test]
    fn call_empties_queue() {
        let mut hooks = Hooks::new(commands());
        hooks.add("set_http_challenge", &[("domain", "example.com"), ("file", "/tmp/x")]);
        hooks.call();
        assert!(hooks.queue.is_empty());
    }
}
