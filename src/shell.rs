use std::fmt;

use shell_escape::unix::escape;

/// How the rendered command relates to the SSH channel it runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detach {
    /// Runs in the foreground; the channel reports its exit status.
    None,
    /// `nohup ... > /dev/null 2>&1`: survives the channel, still waited for.
    Quiet,
    /// `nohup ... > /dev/null 2>&1 &`: backgrounded by the remote shell.
    Background,
}

/// A remote shell command line built from a program and escaped arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    program: String,
    args: Vec<String>,
    detach: Detach,
}

impl RemoteCommand {
    pub fn new(program: impl Into<String>) -> RemoteCommand {
        RemoteCommand {
            program: program.into(),
            args: Vec::new(),
            detach: Detach::None,
        }
    }

    pub fn arg(&mut self, argument: impl Into<String>) -> &mut Self {
        self.args.push(argument.into());
        self
    }

    pub fn args<I, S>(&mut self, arguments: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(arguments.into_iter().map(Into::into));
        self
    }

    pub fn quiet(&mut self) -> &mut Self {
        self.detach = Detach::Quiet;
        self
    }

    pub fn background(&mut self) -> &mut Self {
        self.detach = Detach::Background;
        self
    }

    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut command = self.program.clone();
        for arg in &self.args {
            command.push(' ');
            command.push_str(&escape(arg.as_str().into()));
        }

        match self.detach {
            Detach::None => write!(f, "{}", command),
            Detach::Quiet => write!(f, "nohup {} > /dev/null 2>&1", command),
            Detach::Background => write!(f, "nohup {} > /dev/null 2>&1 &", command),
        }
    }
}

/// Shell-escapes a single word, e.g. a path.
pub fn quote(word: &str) -> String {
    escape(word.into()).into_owned()
}
