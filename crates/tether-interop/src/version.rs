use std::{fmt, str::FromStr};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VersionParseError {
    #[error("empty version string")]
    Empty,
    #[error("unknown engine kind: {0}")]
    UnknownEngine(String),
    #[error("invalid version number: {0}")]
    InvalidNumber(String),
    #[error("invalid custom iteration: {0}")]
    InvalidIteration(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EngineKind {
    Byond,
    OpenDream,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Byond => "Byond",
            EngineKind::OpenDream => "OpenDream",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "byond" => Ok(EngineKind::Byond),
            "opendream" => Ok(EngineKind::OpenDream),
            _ => Err(VersionParseError::UnknownEngine(s.to_string())),
        }
    }
}

/// `major.minor[.patch]`, e.g. `515.1633` or `0.2.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DottedVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: Option<u32>,
}

impl DottedVersion {
    pub fn new(major: u32, minor: u32) -> Self {
        Self {
            major,
            minor,
            patch: None,
        }
    }

    pub fn with_patch(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch: Some(patch),
        }
    }
}

impl fmt::Display for DottedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.patch {
            Some(patch) => write!(f, "{}.{}.{}", self.major, self.minor, patch),
            None => write!(f, "{}.{}", self.major, self.minor),
        }
    }
}

impl FromStr for DottedVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(VersionParseError::Empty);
        }
        let parts: Vec<&str> = s.split('.').collect();
        if !(2..=3).contains(&parts.len()) {
            return Err(VersionParseError::InvalidNumber(s.to_string()));
        }
        let parse = |p: &str| -> Result<u32, VersionParseError> {
            if p.is_empty() || !p.chars().all(|c| c.is_ascii_digit()) {
                return Err(VersionParseError::InvalidNumber(s.to_string()));
            }
            p.parse::<u32>()
                .map_err(|_| VersionParseError::InvalidNumber(s.to_string()))
        };
        Ok(Self {
            major: parse(parts[0])?,
            minor: parse(parts[1])?,
            patch: parts.get(2).map(|p| parse(p)).transpose()?,
        })
    }
}

/// Identifies one engine build. The text form doubles as the on-disk directory name
/// and the content of the installation's version marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EngineVersion {
    pub engine: EngineKind,
    pub version: DottedVersion,
    pub custom_iteration: Option<u32>,
}

impl EngineVersion {
    pub fn new(engine: EngineKind, version: DottedVersion) -> Self {
        Self {
            engine,
            version,
            custom_iteration: None,
        }
    }

    pub fn with_custom_iteration(&self, iteration: u32) -> Self {
        Self {
            custom_iteration: Some(iteration),
            ..self.clone()
        }
    }

    /// Same engine and version number, ignoring the custom iteration.
    pub fn same_release(&self, other: &EngineVersion) -> bool {
        self.engine == other.engine && self.version == other.version
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.engine, self.version)?;
        if let Some(iteration) = self.custom_iteration {
            write!(f, "+{iteration}")?;
        }
        Ok(())
    }
}

impl FromStr for EngineVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(VersionParseError::Empty);
        }
        let (engine, rest) = s
            .split_once('-')
            .ok_or_else(|| VersionParseError::InvalidNumber(s.to_string()))?;
        let engine: EngineKind = engine.parse()?;
        let (number, iteration) = match rest.split_once('+') {
            Some((number, iteration)) => {
                let parsed = iteration
                    .parse::<u32>()
                    .map_err(|_| VersionParseError::InvalidIteration(iteration.to_string()))?;
                (number, Some(parsed))
            }
            None => (rest, None),
        };
        Ok(Self {
            engine,
            version: number.parse()?,
            custom_iteration: iteration,
        })
    }
}

impl TryFrom<String> for EngineVersion {
    type Error = VersionParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EngineVersion> for String {
    fn from(value: EngineVersion) -> Self {
        value.to_string()
    }
}

/// Version of the interop layer embedded in the engine process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InteropVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl InteropVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Interop compatibility is decided by the major version alone.
    pub fn is_compatible_with(&self, other: &InteropVersion) -> bool {
        self.major == other.major
    }

    pub fn supports_chunking(&self) -> bool {
        *self >= crate::CHUNKING_MIN_INTEROP_VERSION
    }
}

impl fmt::Display for InteropVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for InteropVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dotted: DottedVersion = s.parse()?;
        Ok(Self {
            major: dotted.major,
            minor: dotted.minor,
            patch: dotted.patch.unwrap_or(0),
        })
    }
}

impl TryFrom<String> for InteropVersion {
    type Error = VersionParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<InteropVersion> for String {
    fn from(value: InteropVersion) -> Self {
        value.to_string()
    }
}
