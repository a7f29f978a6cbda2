use std::fmt;

use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum PatchType {
    /// Upgrades the progress store's own tables
    #[strum(to_string = "SETUP", serialize = "INIT")]
    Setup,
    #[strum(to_string = "UPGRADE", serialize = "PATCH")]
    Upgrade,
    /// Branch or return edge, usable regardless of direction
    #[strum(to_string = "SWITCH", serialize = "BRANCH", serialize = "RETURN")]
    Switch,
    #[strum(to_string = "DOWNGRADE")]
    Downgrade,
}

/// A directed, typed edge between two versions. `source` of `None` is the
/// empty database; `line` is the index of the block header in the definition file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    patch_type: PatchType,
    source: Option<String>,
    target: String,
    open: bool,
    line: usize,
}

impl Patch {
    pub fn new(
        patch_type: PatchType,
        source: Option<String>,
        target: impl Into<String>,
        open: bool,
        line: usize,
    ) -> Self {
        Patch {
            patch_type,
            source,
            target: target.into(),
            open,
            line,
        }
    }

    pub fn patch_type(&self) -> PatchType {
        self.patch_type
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn line(&self) -> usize {
        self.line
    }

    pub fn is_setup(&self) -> bool {
        self.patch_type == PatchType::Setup
    }

    pub fn is_downgrade(&self) -> bool {
        self.patch_type == PatchType::Downgrade
    }
}

impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{} \"{}\" --> \"{}\"",
            self.patch_type,
            if self.open { " OPEN" } else { "" },
            self.source.as_deref().unwrap_or(""),
            self.target
        )
    }
}

/// Renders an optional version the way messages quote it.
pub fn display_version(version: Option<&str>) -> String {
    match version {
        Some(v) => format!("\"{}\"", v),
        None => "no version".to_string(),
    }
}
