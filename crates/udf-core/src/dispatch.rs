use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Sync,
    Async,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    Tile,
    File,
}

/// Where the unit of work's code is resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Saved,
    Token,
    Local,
}

/// Where execution physically happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Realtime,
    Local,
    Batch,
}

impl Mode {
    pub const ALL: [Mode; 2] = [Mode::Sync, Mode::Async];

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Sync => "sync",
            Mode::Async => "async",
        }
    }
}

impl Shape {
    pub const ALL: [Shape; 2] = [Shape::Tile, Shape::File];

    pub fn as_str(self) -> &'static str {
        match self {
            Shape::Tile => "tile",
            Shape::File => "file",
        }
    }
}

impl Source {
    pub const ALL: [Source; 3] = [Source::Saved, Source::Token, Source::Local];

    pub fn as_str(self) -> &'static str {
        match self {
            Source::Saved => "saved",
            Source::Token => "token",
            Source::Local => "local",
        }
    }
}

impl Engine {
    pub const ALL: [Engine; 3] = [Engine::Realtime, Engine::Local, Engine::Batch];

    pub fn as_str(self) -> &'static str {
        match self {
            Engine::Realtime => "realtime",
            Engine::Local => "local",
            Engine::Batch => "batch",
        }
    }
}

impl FromStr for Shape {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tile" => Ok(Shape::Tile),
            "file" => Ok(Shape::File),
            other => Err(crate::Error::config(format!(
                "unknown shape {other:?} (expected tile or file)"
            ))),
        }
    }
}

impl FromStr for Engine {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "realtime" => Ok(Engine::Realtime),
            "local" => Ok(Engine::Local),
            "batch" => Ok(Engine::Batch),
            other => Err(crate::Error::config(format!(
                "unknown engine {other:?} (expected realtime, local or batch)"
            ))),
        }
    }
}

/// The four orthogonal flags that select a call strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DispatchKey {
    pub mode: Mode,
    pub shape: Shape,
    pub source: Source,
    pub engine: Engine,
}

impl DispatchKey {
    pub fn new(mode: Mode, shape: Shape, source: Source, engine: Engine) -> Self {
        Self {
            mode,
            shape,
            source,
            engine,
        }
    }

    /// Every combination of the four flags.
    pub fn all() -> impl Iterator<Item = DispatchKey> {
        Mode::ALL.into_iter().flat_map(|mode| {
            Shape::ALL.into_iter().flat_map(move |shape| {
                Source::ALL.into_iter().flat_map(move |source| {
                    Engine::ALL
                        .into_iter()
                        .map(move |engine| DispatchKey::new(mode, shape, source, engine))
                })
            })
        })
    }
}

impl fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {})",
            self.mode.as_str(),
            self.shape.as_str(),
            self.source.as_str(),
            self.engine.as_str()
        )
    }
}
