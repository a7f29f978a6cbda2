use std::fs;
use std::path::Path;
use std::sync::Arc;

use log::debug;

use crate::error::UpgradeError;
use crate::source::{split_lines, Boundary, CommandReader, Encoding};

/// A plain SQL file, as included with `RUN "<file>"`. No blocks; commands run to the
/// end of the file.
pub struct SqlFile {
    path: Arc<Path>,
    lines: Vec<String>,
}

impl SqlFile {
    pub fn open(path: &Path) -> Result<Self, UpgradeError> {
        let path: Arc<Path> = Arc::from(dunce::canonicalize(path)?);
        let bytes = fs::read(&path)?;
        let (text, encoding) = Encoding::decode(&bytes, &path)?;
        debug!("Opened SQL file {} ({:?})", path.display(), encoding);

        Ok(SqlFile {
            lines: split_lines(&text),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn reader(&self) -> CommandReader<'_> {
        CommandReader::new(&self.lines, self.path.clone(), 0, Boundary::EndOfFile)
    }
}
