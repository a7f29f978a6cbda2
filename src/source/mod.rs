pub mod sql_file;
pub mod upgrade_file;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use phf::Map;
use phf_macros::phf_map;
use strum::{Display, EnumString};

use crate::directive::{self, PatchHeader};
use crate::error::UpgradeError;

/// Marker that introduces a directive line.
pub const DIRECTIVE_MARKER: &str = "--*";

/// A 1-based line in a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    path: Arc<Path>,
    line: usize,
}

impl Location {
    pub fn new(path: Arc<Path>, line: usize) -> Self {
        Location { path, line }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn line(&self) -> usize {
        self.line
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {} of {}", self.line, self.path.display())
    }
}

/// A unit read from a source: SQL text to execute (persistent) or the body of a
/// directive line (transient).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    text: String,
    persistent: bool,
    location: Location,
}

impl Command {
    pub fn persistent(text: impl Into<String>, location: Location) -> Self {
        Command {
            text: text.into(),
            persistent: true,
            location,
        }
    }

    pub fn transient(text: impl Into<String>, location: Location) -> Self {
        Command {
            text: text.into(),
            persistent: false,
            location,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn is_transient(&self) -> bool {
        !self.persistent
    }

    pub fn location(&self) -> &Location {
        &self.location
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(ascii_case_insensitive, serialize_all = "UPPERCASE")]
pub enum DelimiterMode {
    /// Alone on its line
    Isolated,
    /// Last thing on a line
    Trailing,
    /// Anywhere on a line
    Free,
}

/// Statement terminator, matched case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delimiter {
    text: String,
    mode: DelimiterMode,
}

impl Delimiter {
    pub fn new(text: impl Into<String>, mode: DelimiterMode) -> Self {
        Delimiter {
            text: text.into(),
            mode,
        }
    }

    pub fn defaults() -> Vec<Delimiter> {
        vec![Delimiter::new("GO", DelimiterMode::Isolated)]
    }

    /// Splits `line` around this delimiter into the statement text before it and the
    /// text after it.
    fn split<'l>(&self, line: &'l str) -> Option<(&'l str, &'l str)> {
        match self.mode {
            DelimiterMode::Isolated => line
                .trim()
                .eq_ignore_ascii_case(&self.text)
                .then_some(("", "")),
            DelimiterMode::Trailing => {
                let trimmed = line.trim_end();
                let start = trimmed.len().checked_sub(self.text.len())?;
                let tail = trimmed.get(start..)?;
                tail.eq_ignore_ascii_case(&self.text)
                    .then(|| (&trimmed[..start], ""))
            }
            DelimiterMode::Free => {
                // ASCII lowercasing keeps byte offsets intact
                let position = line
                    .to_ascii_lowercase()
                    .find(&self.text.to_ascii_lowercase())?;
                Some((&line[..position], &line[position + self.text.len()..]))
            }
        }
    }
}

impl fmt::Display for Delimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.mode, self.text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    /// ISO-8859-1; also used for US-ASCII, which it contains
    Latin1,
}

static ENCODINGS: Map<&'static str, Encoding> = phf_map! {
    "UTF-8" => Encoding::Utf8,
    "UTF8" => Encoding::Utf8,
    "ISO-8859-1" => Encoding::Latin1,
    "ISO8859-1" => Encoding::Latin1,
    "ISO_8859_1" => Encoding::Latin1,
    "LATIN1" => Encoding::Latin1,
    "LATIN-1" => Encoding::Latin1,
    "US-ASCII" => Encoding::Latin1,
    "ASCII" => Encoding::Latin1,
};

impl Encoding {
    pub fn from_name(name: &str) -> Option<Encoding> {
        ENCODINGS.get(name.trim().to_ascii_uppercase().as_str()).copied()
    }

    /// Decodes raw file content. A UTF-8 byte order mark is dropped, and an
    /// `--* ENCODING "<name>"` first line selects the encoding of the whole file.
    pub fn decode(bytes: &[u8], path: &Arc<Path>) -> Result<(String, Encoding), UpgradeError> {
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
        let location = Location::new(path.clone(), 1);

        let first_line = bytes.split(|b| *b == b'\n').next().unwrap_or_default();
        let first_line: String = first_line.iter().map(|&b| b as char).collect();

        let mut encoding = Encoding::Utf8;
        if let Some(body) = first_line.trim().strip_prefix(DIRECTIVE_MARKER) {
            if let Some(directive::Directive::Encoding(name)) = directive::Directive::parse(body.trim()) {
                encoding = Encoding::from_name(&name).ok_or_else(|| {
                    UpgradeError::source_error(format!("Unsupported encoding \"{}\"", name), &location)
                })?;
            }
        }

        let text = match encoding {
            Encoding::Utf8 => String::from_utf8(bytes.to_vec()).map_err(|e| {
                UpgradeError::source_error(format!("File is not valid UTF-8: {}", e), &location)
            })?,
            Encoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        };

        Ok((text, encoding))
    }
}

/// Splits decoded text into lines without their terminators.
pub fn split_lines(text: &str) -> Vec<String> {
    text.lines().map(str::to_owned).collect()
}

/// How a command stream ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// A `--* /<TYPE>` or `--* END <TYPE>` line closes the block
    EndMarker,
    /// Plain SQL file: runs to the end of the file
    EndOfFile,
}

/// Reads commands from a range of lines.
pub struct CommandReader<'a> {
    lines: &'a [String],
    path: Arc<Path>,
    next: usize,
    boundary: Boundary,
    pending: Option<(String, Location)>,
}

impl<'a> CommandReader<'a> {
    /// `start` is the 0-based index of the first line to read.
    pub fn new(lines: &'a [String], path: Arc<Path>, start: usize, boundary: Boundary) -> Self {
        CommandReader {
            lines,
            path,
            next: start,
            boundary,
            pending: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Location of the line that will be read next.
    pub fn location(&self) -> Location {
        Location::new(self.path.clone(), self.next + 1)
    }

    /// Next command, or `None` at the end of the block or file.
    pub fn read_command(&mut self, delimiters: &[Delimiter]) -> Result<Option<Command>, UpgradeError> {
        let mut buffer = String::new();
        let mut start: Option<Location> = None;

        loop {
            // Text left behind a free delimiter is read like a line of its own
            let (line, location) = match self.pending.take() {
                Some(pending) => pending,
                None => {
                    let Some(line) = self.lines.get(self.next) else {
                        if let Some(start) = start {
                            return Err(UpgradeError::source_error(
                                "Unterminated statement at end of file",
                                &start,
                            ));
                        }
                        if self.boundary == Boundary::EndMarker {
                            return Err(UpgradeError::source_error(
                                "Unexpected end of file, the block has no end marker",
                                &self.location(),
                            ));
                        }
                        return Ok(None);
                    };
                    let location = self.location();
                    self.next += 1;
                    (line.clone(), location)
                }
            };

            if let Some(body) = line.trim().strip_prefix(DIRECTIVE_MARKER) {
                if let Some(start) = start {
                    return Err(UpgradeError::source_error(
                        format!("Unterminated statement, found a directive at {}", location),
                        &start,
                    ));
                }

                let body = body.trim();
                if body.starts_with("//") {
                    continue;
                }
                if self.boundary == Boundary::EndMarker {
                    if directive::is_segment_end(body) {
                        return Ok(None);
                    }
                    if PatchHeader::parse_segment_start(body).is_some() {
                        return Err(UpgradeError::source_error(
                            "Block start found before the end marker of the previous block",
                            &location,
                        ));
                    }
                }
                return Ok(Some(Command::transient(body, location)));
            }

            if start.is_none() && line.trim().is_empty() {
                continue;
            }

            match delimiters.iter().find_map(|d| d.split(&line)) {
                Some((before, after)) => {
                    buffer.push_str(before);
                    if !after.trim().is_empty() {
                        self.pending = Some((after.to_owned(), location.clone()));
                    }

                    let text = buffer.trim();
                    if text.is_empty() {
                        // A delimiter without a statement
                        buffer.clear();
                        start = None;
                        continue;
                    }
                    return Ok(Some(Command::persistent(text, start.unwrap_or(location))));
                }
                None => {
                    if start.is_none() {
                        start = Some(location);
                    }
                    buffer.push_str(&line);
                    buffer.push('\n');
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn path() -> Arc<Path> {
        Arc::from(PathBuf::from("test.sql"))
    }

    fn lines(text: &str) -> Vec<String> {
        split_lines(text)
    }

    fn read_all(text: &str, delimiters: &[Delimiter], boundary: Boundary) -> Vec<(bool, String, usize)> {
        let lines = lines(text);
        let mut reader = CommandReader::new(&lines, path(), 0, boundary);
        let mut result = Vec::new();
        while let Some(command) = reader.read_command(delimiters).unwrap() {
            result.push((
                command.is_persistent(),
                command.text().to_owned(),
                command.location().line(),
            ));
        }
        result
    }

    #[test]
    fn test_isolated_go() {
        let commands = read_all(
            "\n\nCREATE TABLE t (\n  id INTEGER\n)\ngo\n--* SECTION \"x\"\nINSERT INTO t VALUES (1)\n  GO  \n",
            &Delimiter::defaults(),
            Boundary::EndOfFile,
        );
        assert_eq!(
            commands,
            vec![
                (true, "CREATE TABLE t (\n  id INTEGER\n)".to_owned(), 3),
                (false, "SECTION \"x\"".to_owned(), 7),
                (true, "INSERT INTO t VALUES (1)".to_owned(), 8),
            ]
        );
    }

    #[test]
    fn test_trailing_delimiter() {
        let delimiters = vec![Delimiter::new(";", DelimiterMode::Trailing)];
        let commands = read_all(
            "INSERT INTO t\nVALUES (1);\nINSERT INTO t VALUES (2) ;  \n",
            &delimiters,
            Boundary::EndOfFile,
        );
        assert_eq!(
            commands,
            vec![
                (true, "INSERT INTO t\nVALUES (1)".to_owned(), 1),
                (true, "INSERT INTO t VALUES (2)".to_owned(), 3),
            ]
        );
    }

    #[test]
    fn test_free_delimiter_splits_lines() {
        let delimiters = vec![Delimiter::new(";", DelimiterMode::Free)];
        let commands = read_all(
            "INSERT INTO t VALUES (1); INSERT INTO t VALUES (2);\n",
            &delimiters,
            Boundary::EndOfFile,
        );
        assert_eq!(
            commands,
            vec![
                (true, "INSERT INTO t VALUES (1)".to_owned(), 1),
                (true, "INSERT INTO t VALUES (2)".to_owned(), 1),
            ]
        );
    }

    #[test]
    fn test_alternative_delimiters() {
        let delimiters = vec![
            Delimiter::new("GO", DelimiterMode::Isolated),
            Delimiter::new(";", DelimiterMode::Trailing),
        ];
        let commands = read_all("SELECT 1;\nSELECT 2\nGO\n", &delimiters, Boundary::EndOfFile);
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[1].1, "SELECT 2");
    }

    #[test]
    fn test_comments_are_skipped() {
        let commands = read_all(
            "--* // nothing to see\nSELECT 1\nGO\n",
            &Delimiter::defaults(),
            Boundary::EndOfFile,
        );
        assert_eq!(commands, vec![(true, "SELECT 1".to_owned(), 2)]);
    }

    #[test]
    fn test_unterminated_statement_before_directive() {
        let lines = lines("SELECT 1\n--* SECTION \"x\"\nGO\n");
        let mut reader = CommandReader::new(&lines, path(), 0, Boundary::EndOfFile);
        let err = reader.read_command(&Delimiter::defaults()).unwrap_err();
        assert!(matches!(err, UpgradeError::Source { ref location, .. } if location.line() == 1));
    }

    #[test]
    fn test_unterminated_statement_at_end_of_file() {
        let lines = lines("SELECT 1\n");
        let mut reader = CommandReader::new(&lines, path(), 0, Boundary::EndOfFile);
        assert!(reader.read_command(&Delimiter::defaults()).is_err());
    }

    #[test]
    fn test_block_end_marker() {
        let lines = lines("--* UPGRADE \"\" --> \"1.0\"\nSELECT 1\nGO\n--* /UPGRADE\nSELECT 2\nGO\n");
        let mut reader = CommandReader::new(&lines, path(), 1, Boundary::EndMarker);
        let delimiters = Delimiter::defaults();
        assert_eq!(reader.read_command(&delimiters).unwrap().unwrap().text(), "SELECT 1");
        assert!(reader.read_command(&delimiters).unwrap().is_none());
    }

    #[test]
    fn test_block_without_end_marker() {
        let first = lines("SELECT 1\nGO\n");
        let mut reader = CommandReader::new(&first, path(), 0, Boundary::EndMarker);
        let delimiters = Delimiter::defaults();
        assert!(reader.read_command(&delimiters).unwrap().is_some());
        assert!(reader.read_command(&delimiters).is_err());

        let second = lines("SELECT 1\nGO\n--* UPGRADE \"1.0\" --> \"1.1\"\n");
        let mut reader = CommandReader::new(&second, path(), 0, Boundary::EndMarker);
        assert!(reader.read_command(&delimiters).unwrap().is_some());
        assert!(reader.read_command(&delimiters).is_err());
    }

    #[test]
    fn test_delimiter_split() {
        let go = Delimiter::new("GO", DelimiterMode::Isolated);
        assert_eq!(go.split("  go "), Some(("", "")));
        assert_eq!(go.split("GOTO"), None);

        let semi = Delimiter::new(";", DelimiterMode::Trailing);
        assert_eq!(semi.split("SELECT 1;  "), Some(("SELECT 1", "")));
        assert_eq!(semi.split("SELECT ';' FROM t"), None);

        let free = Delimiter::new("end", DelimiterMode::Free);
        assert_eq!(free.split("a END b"), Some(("a ", " b")));
    }

    #[test]
    fn test_decode_encodings() {
        let (text, encoding) = Encoding::decode(b"\xEF\xBB\xBFSELECT 1\n", &path()).unwrap();
        assert_eq!(text, "SELECT 1\n");
        assert_eq!(encoding, Encoding::Utf8);

        let (text, encoding) =
            Encoding::decode(b"--* ENCODING \"ISO-8859-1\"\nSELECT '\xE9'\n", &path()).unwrap();
        assert_eq!(encoding, Encoding::Latin1);
        assert!(text.ends_with("SELECT '\u{e9}'\n"));

        assert!(Encoding::decode(b"--* ENCODING \"EBCDIC\"\n", &path()).is_err());
        assert!(Encoding::decode(b"SELECT '\xE9'\n", &path()).is_err());
    }
}
