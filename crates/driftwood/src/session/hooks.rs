//! Shell-side integration: the prompt hook that emits the completion
//! marker into the output stream.

use crate::blocks::MARKER_PREFIX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShellFlavor {
    Bash,
    Zsh,
    Other,
}

/// Guesses the flavor from the shell program path.
pub fn shell_flavor(program: &str) -> ShellFlavor {
    let name = program.rsplit('/').next().unwrap_or(program);
    if name.contains("zsh") {
        ShellFlavor::Zsh
    } else if name.contains("bash") || name == "sh" {
        ShellFlavor::Bash
    } else {
        ShellFlavor::Other
    }
}

/// Snippet a user can add to their shell init to emit the marker after
/// every command.
pub fn prompt_hook(flavor: ShellFlavor) -> Option<String> {
    match flavor {
        ShellFlavor::Bash => Some(format!(
            "PROMPT_COMMAND='printf \"{MARKER_PREFIX}%d \" \"$?\"'"
        )),
        ShellFlavor::Zsh => Some(format!(
            "precmd() {{ printf \"{MARKER_PREFIX}%d \" \"$?\" }}"
        )),
        ShellFlavor::Other => None,
    }
}

/// Environment variable that installs the hook at spawn time, for shells
/// that honor it.
pub(crate) fn hook_env(program: &str) -> Option<(String, String)> {
    match shell_flavor(program) {
        ShellFlavor::Bash => Some((
            "PROMPT_COMMAND".to_string(),
            format!("printf \"{MARKER_PREFIX}%d \" \"$?\""),
        )),
        _ => None,
    }
}
