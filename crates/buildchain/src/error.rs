use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A Dockerfile needs an input the task does not declare.
    DependencyDeclaration,
    /// The container engine failed (build, save or run).
    Engine,
    /// Generated package metadata does not name every declared source.
    MetadataIncomplete,
    /// A source download failed.
    Transport,
    Io,
    Config,
    Plan,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Config, msg)
    }

    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn dependency<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::DependencyDeclaration, msg)
    }

    pub fn engine<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Engine, msg)
    }

    pub fn metadata<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::MetadataIncomplete, msg)
    }

    pub fn transport<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Transport, msg)
    }

    pub fn io<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Io, msg)
    }

    pub fn plan<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Plan, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Prefix the message with context, keeping the kind.
    pub fn context(self, prefix: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            msg: format!("{prefix}: {}", self.msg),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
