use std::fs;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info};

use crate::directive::{DefinitionLine, PatchHeader};
use crate::error::UpgradeError;
use crate::graph::PatchGraph;
use crate::patch::{Patch, PatchType};
use crate::source::{
    split_lines, Boundary, CommandReader, Delimiter, Encoding, Location, DIRECTIVE_MARKER,
};

/// An upgrade definition file: a `DEFINITION` header declaring every patch, followed
/// by one block of commands per patch.
pub struct UpgradeFile {
    path: Arc<Path>,
    lines: Vec<String>,
    encoding: Encoding,
    graph: PatchGraph,
    delimiters: Option<Vec<Delimiter>>,
    control_tables: Option<(String, String)>,
}

/// A patch declared in the header, waiting for its block to be found.
struct Declared {
    header: PatchHeader,
    location: Location,
    line: Option<usize>,
}

impl Declared {
    /// Setup and upgrade patches are addressed separately, each by source and target.
    fn addressed_by(&self, header: &PatchHeader) -> bool {
        let setup = |h: &PatchHeader| h.patch_type == PatchType::Setup;
        setup(&self.header) == setup(header)
            && self.header.source == header.source
            && self.header.target == header.target
    }
}

impl UpgradeFile {
    pub fn open(path: &Path) -> Result<Self, UpgradeError> {
        let path: Arc<Path> = Arc::from(dunce::canonicalize(path)?);
        info!("Opening upgrade file {}", path.display());

        let bytes = fs::read(&path)?;
        Self::from_bytes(&bytes, path)
    }

    pub fn from_bytes(bytes: &[u8], path: Arc<Path>) -> Result<Self, UpgradeError> {
        let (text, encoding) = Encoding::decode(bytes, &path)?;

        let mut file = UpgradeFile {
            path,
            lines: split_lines(&text),
            encoding,
            graph: PatchGraph::default(),
            delimiters: None,
            control_tables: None,
        };
        file.scan()?;
        Ok(file)
    }

    fn location(&self, index: usize) -> Location {
        Location::new(self.path.clone(), index + 1)
    }

    fn scan(&mut self) -> Result<(), UpgradeError> {
        let (mut declared, body_start) = self.read_definition()?;

        for index in body_start..self.lines.len() {
            let Some(body) = self.lines[index].trim().strip_prefix(DIRECTIVE_MARKER) else {
                continue;
            };
            let Some(header) = PatchHeader::parse_segment_start(body.trim()) else {
                continue;
            };

            let location = self.location(index);
            let declaration = declared
                .iter_mut()
                .find(|d| d.addressed_by(&header))
                .ok_or_else(|| {
                    UpgradeError::source_error(
                        format!(
                            "Block {} \"{}\" --> \"{}\" is not declared in the definition",
                            header.patch_type,
                            header.source.as_deref().unwrap_or(""),
                            header.target
                        ),
                        &location,
                    )
                })?;

            if declaration.header.patch_type != header.patch_type {
                return Err(UpgradeError::source_error(
                    format!(
                        "Block type {} does not match the definition ({})",
                        header.patch_type, declaration.header.patch_type
                    ),
                    &location,
                ));
            }
            if declaration.line.is_some() {
                return Err(UpgradeError::source_error("Duplicate block", &location));
            }
            declaration.line = Some(index);
        }

        let mut patches = Vec::with_capacity(declared.len());
        for declaration in declared {
            let Some(line) = declaration.line else {
                return Err(UpgradeError::source_error(
                    format!(
                        "No block found for {} \"{}\" --> \"{}\"",
                        declaration.header.patch_type,
                        declaration.header.source.as_deref().unwrap_or(""),
                        declaration.header.target
                    ),
                    &declaration.location,
                ));
            };
            let PatchHeader {
                patch_type,
                open,
                source,
                target,
            } = declaration.header;
            patches.push(Patch::new(patch_type, source, target, open, line));
        }

        debug!("Upgrade file declares {} patches", patches.len());
        self.graph = PatchGraph::load(patches)?;
        Ok(())
    }

    /// Parses the header. Returns the declared patches and the index of the first line
    /// after the header.
    fn read_definition(&mut self) -> Result<(Vec<Declared>, usize), UpgradeError> {
        let mut index = 0;
        let mut declared: Vec<Declared> = Vec::new();
        let mut started = false;

        loop {
            let Some(line) = self.lines.get(index) else {
                let message = if started {
                    "Unexpected end of file, the definition has no end marker"
                } else {
                    "Expecting \"--* DEFINITION\" at the start of the file"
                };
                return Err(UpgradeError::source_error(message, &self.location(index)));
            };
            let location = self.location(index);
            index += 1;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let Some(body) = trimmed.strip_prefix(DIRECTIVE_MARKER).map(str::trim) else {
                return Err(UpgradeError::source_error(
                    if started {
                        "Only directive lines are allowed in the definition"
                    } else {
                        "Expecting \"--* DEFINITION\" at the start of the file"
                    },
                    &location,
                ));
            };
            if body.starts_with("//") {
                continue;
            }

            if !started {
                if location.line() == 1 && body.to_ascii_uppercase().starts_with("ENCODING") {
                    continue;
                }
                if DefinitionLine::parse(body) != Some(DefinitionLine::Start) {
                    return Err(UpgradeError::source_error(
                        "Expecting \"--* DEFINITION\" at the start of the file",
                        &location,
                    ));
                }
                started = true;
                continue;
            }

            match DefinitionLine::parse(body) {
                Some(DefinitionLine::End) => return Ok((declared, index)),
                Some(DefinitionLine::Patch(header)) => {
                    if declared.iter().any(|d| d.addressed_by(&header)) {
                        return Err(UpgradeError::source_error(
                            "Duplicate definition",
                            &location,
                        ));
                    }
                    declared.push(Declared {
                        header,
                        location,
                        line: None,
                    });
                }
                Some(DefinitionLine::ControlTables {
                    version_table,
                    log_table,
                }) => self.control_tables = Some((version_table, log_table)),
                Some(DefinitionLine::Delimiters(delimiters)) => self.delimiters = Some(delimiters),
                Some(DefinitionLine::Start) | None => {
                    return Err(UpgradeError::source_error(
                        format!("Unexpected definition line \"{}\"", body),
                        &location,
                    ));
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn graph(&self) -> &PatchGraph {
        &self.graph
    }

    /// Delimiters for blocks that don't set their own.
    pub fn delimiters(&self) -> Vec<Delimiter> {
        self.delimiters.clone().unwrap_or_else(Delimiter::defaults)
    }

    /// `(version table, log table)` when the header overrides the defaults.
    pub fn control_tables(&self) -> Option<(&str, &str)> {
        self.control_tables
            .as_ref()
            .map(|(version, log)| (version.as_str(), log.as_str()))
    }

    /// A reader positioned at the first line of `patch`'s block.
    pub fn segment(&self, patch: &Patch) -> CommandReader<'_> {
        CommandReader::new(&self.lines, self.path.clone(), patch.line() + 1, Boundary::EndMarker)
    }
}
