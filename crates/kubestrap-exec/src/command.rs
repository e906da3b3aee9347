//! Shell command construction
//!
//! Executors accept a single command line; `ShellCommand` keeps program and
//! arguments apart until rendering so arguments are always quoted.

use std::fmt;

/// A program plus arguments, rendered into a POSIX shell command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    program: String,
    args: Vec<String>,
    sudo: bool,
    env: Vec<(String, String)>,
}

impl ShellCommand {
    /// Create a command for `program` with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            sudo: false,
            env: Vec::new(),
        }
    }

    /// Run a raw script through `sh -c`
    ///
    /// The script itself is passed as one quoted argument, so pipes and
    /// redirections inside it are interpreted by the remote shell.
    pub fn script(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    /// Append one argument
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the command
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Prefix with `sudo` (non-interactive)
    #[must_use]
    pub fn sudo(mut self, enabled: bool) -> Self {
        self.sudo = enabled;
        self
    }

    /// Program name
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments, unquoted
    #[must_use]
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Render into a command line safe to hand to `sh -c`
    #[must_use]
    pub fn render(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + self.env.len() + 3);
        if self.sudo {
            parts.push("sudo -n".to_string());
        }
        if !self.env.is_empty() {
            parts.push("env".to_string());
            for (key, value) in &self.env {
                parts.push(format!("{key}={}", quote(value)));
            }
        }
        parts.push(quote(&self.program));
        parts.extend(self.args.iter().map(|a| quote(a)));
        parts.join(" ")
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Single-quote a word for POSIX sh unless it is made of safe characters only
#[must_use]
pub fn quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_words_unquoted() {
        let cmd = ShellCommand::new("apt-get")
            .args(["install", "-y", "curl"])
            .sudo(true);
        assert_eq!(cmd.render(), "sudo -n apt-get install -y curl");
    }

    #[test]
    fn test_quotes_spaces_and_single_quotes() {
        let cmd = ShellCommand::new("echo").arg("it's here");
        assert_eq!(cmd.render(), r"echo 'it'\''s here'");
        assert_eq!(quote(""), "''");
    }

    #[test]
    fn test_script_is_one_argument() {
        let cmd = ShellCommand::script("swapon --show | wc -l");
        assert_eq!(cmd.render(), "sh -c 'swapon --show | wc -l'");
    }

    #[test]
    fn test_env_prefix() {
        let cmd = ShellCommand::new("apt-get")
            .env("DEBIAN_FRONTEND", "noninteractive")
            .arg("update");
        assert_eq!(cmd.render(), "env DEBIAN_FRONTEND=noninteractive apt-get update");
    }
}
