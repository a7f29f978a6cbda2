use pest::iterators::{Pair, Pairs};
use pest::Parser;
use pest_derive::Parser;

use crate::database::CommitStrategy;
use crate::patch::PatchType;
use crate::source::{Delimiter, DelimiterMode};

#[derive(Parser)]
#[grammar = "directive/directive.pest"]
pub struct DirectiveParser;

/// Control directives recognised in the body of an upgrade or SQL file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Section { level: u8, message: String },
    SetDelimiter(Vec<Delimiter>),
    ResetDelimiter,
    IgnoreSqlError(Vec<String>),
    EndIgnore,
    SetUser(String),
    SelectConnection(String),
    IfScript(String),
    IfHistory { negated: bool, version: String },
    Else,
    EndIf,
    Skip,
    EndSkip,
    EscapeProcessing(bool),
    SetCommitStrategy(CommitStrategy),
    ResetCommitStrategy,
    Transient,
    EndTransient,
    Encoding(String),
}

impl Directive {
    /// Parses the text after the `--*` marker. `None` means not a known directive.
    pub fn parse(text: &str) -> Option<Directive> {
        let pair = parse_rule(Rule::directive, text)?.into_inner().next()?;
        let rule = pair.as_rule();
        let mut inner = pair.into_inner();

        let directive = match rule {
            Rule::section => {
                let mut level = 1;
                let mut message = String::new();
                for p in inner {
                    match p.as_rule() {
                        Rule::section_level => level = p.as_str().parse().ok()?,
                        Rule::quoted => message = unquote(p),
                        _ => {}
                    }
                }
                Directive::Section { level, message }
            }
            Rule::set_delimiter => Directive::SetDelimiter(parse_delimiters(inner)?),
            Rule::reset_delimiter => Directive::ResetDelimiter,
            Rule::ignore_error => Directive::IgnoreSqlError(
                inner
                    .filter(|p| p.as_rule() == Rule::error_code)
                    .map(|p| p.as_str().to_owned())
                    .collect(),
            ),
            Rule::end_ignore => Directive::EndIgnore,
            Rule::set_user => Directive::SetUser(inner.next()?.as_str().to_owned()),
            Rule::select_connection => {
                Directive::SelectConnection(inner.next()?.as_str().to_owned())
            }
            Rule::if_script => Directive::IfScript(inner.next()?.as_str().trim().to_owned()),
            Rule::if_history => {
                let mut negated = false;
                let mut version = String::new();
                for p in inner {
                    match p.as_rule() {
                        Rule::negation => negated = true,
                        Rule::quoted => version = unquote(p),
                        _ => {}
                    }
                }
                Directive::IfHistory { negated, version }
            }
            Rule::else_branch => Directive::Else,
            Rule::end_if => Directive::EndIf,
            Rule::skip_block => Directive::Skip,
            Rule::end_skip => Directive::EndSkip,
            Rule::escape_processing => {
                Directive::EscapeProcessing(inner.next()?.as_str().eq_ignore_ascii_case("ON"))
            }
            Rule::set_commit_strategy => {
                Directive::SetCommitStrategy(inner.next()?.as_str().parse().ok()?)
            }
            Rule::reset_commit_strategy => Directive::ResetCommitStrategy,
            Rule::transient => Directive::Transient,
            Rule::end_transient => Directive::EndTransient,
            Rule::encoding => Directive::Encoding(unquote(inner.next()?)),
            _ => return None,
        };

        Some(directive)
    }
}

/// `<TYPE> [OPEN] "<source>" --> "<target>"`, as found in the definition header and
/// at the start of each block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchHeader {
    pub patch_type: PatchType,
    pub open: bool,
    pub source: Option<String>,
    pub target: String,
}

impl PatchHeader {
    fn from_pair(pair: Pair<'_, Rule>) -> Option<PatchHeader> {
        let mut patch_type = None;
        let mut open = false;
        let mut versions = Vec::with_capacity(2);

        for p in pair.into_inner() {
            match p.as_rule() {
                Rule::patch_kind => patch_type = p.as_str().parse().ok(),
                Rule::open_flag => open = true,
                Rule::quoted => versions.push(unquote(p)),
                _ => {}
            }
        }

        let target = versions.pop()?;
        let source = versions.pop()?;
        Some(PatchHeader {
            patch_type: patch_type?,
            open,
            source: (!source.is_empty()).then_some(source),
            target,
        })
    }

    pub fn parse_segment_start(text: &str) -> Option<PatchHeader> {
        let pair = parse_rule(Rule::segment_start, text)?.into_inner().next()?;
        Self::from_pair(pair)
    }
}

pub fn is_segment_end(text: &str) -> bool {
    DirectiveParser::parse(Rule::segment_end, text).is_ok()
}

/// One line of the `DEFINITION` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinitionLine {
    Start,
    End,
    Patch(PatchHeader),
    ControlTables { version_table: String, log_table: String },
    Delimiters(Vec<Delimiter>),
}

impl DefinitionLine {
    pub fn parse(text: &str) -> Option<DefinitionLine> {
        let pair = parse_rule(Rule::definition_line, text)?.into_inner().next()?;
        let line = match pair.as_rule() {
            Rule::definition_start => DefinitionLine::Start,
            Rule::definition_end => DefinitionLine::End,
            Rule::patch_header => DefinitionLine::Patch(PatchHeader::from_pair(pair)?),
            Rule::control_tables => {
                let mut names = pair.into_inner().map(|p| p.as_str().to_owned());
                DefinitionLine::ControlTables {
                    version_table: names.next()?,
                    log_table: names.next()?,
                }
            }
            Rule::set_delimiter => DefinitionLine::Delimiters(parse_delimiters(pair.into_inner())?),
            _ => return None,
        };
        Some(line)
    }
}

/// File name of a `RUN "<file>"` command.
pub fn parse_run(text: &str) -> Option<String> {
    let pair = parse_rule(Rule::run_command, text)?;
    pair.into_inner().find(|p| p.as_rule() == Rule::quoted).map(unquote)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssertMode {
    Exists,
    Empty,
}

/// `ASSERT EXISTS|EMPTY MESSAGE "<message>" SELECT ...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertCommand {
    pub mode: AssertMode,
    pub message: String,
    pub query: String,
}

impl AssertCommand {
    pub fn parse(text: &str) -> Option<AssertCommand> {
        let pair = parse_rule(Rule::assert_command, text)?;
        let mut mode = AssertMode::Exists;
        let mut message = String::new();
        let mut query = String::new();

        for p in pair.into_inner() {
            match p.as_rule() {
                Rule::assert_mode if p.as_str().eq_ignore_ascii_case("EMPTY") => {
                    mode = AssertMode::Empty
                }
                Rule::quoted => message = unquote(p),
                Rule::select_text => query = p.as_str().to_owned(),
                _ => {}
            }
        }

        Some(AssertCommand { mode, message, query })
    }
}

/// Query of a `PRINT SELECT ...` command.
pub fn parse_print(text: &str) -> Option<String> {
    let pair = parse_rule(Rule::print_command, text)?;
    pair.into_inner()
        .find(|p| p.as_rule() == Rule::select_text)
        .map(|p| p.as_str().to_owned())
}

fn parse_rule(rule: Rule, text: &str) -> Option<Pair<'_, Rule>> {
    DirectiveParser::parse(rule, text).ok()?.next()
}

fn unquote(pair: Pair<'_, Rule>) -> String {
    pair.into_inner()
        .next()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_default()
}

fn parse_delimiters(pairs: Pairs<'_, Rule>) -> Option<Vec<Delimiter>> {
    pairs
        .filter(|p| p.as_rule() == Rule::delimiter_spec)
        .map(|spec| {
            // Without an explicit mode the delimiter may appear anywhere on a line
            let mut mode = DelimiterMode::Free;
            let mut text = None;
            for p in spec.into_inner() {
                match p.as_rule() {
                    Rule::delimiter_mode => mode = p.as_str().parse().ok()?,
                    Rule::delimiter_text => text = Some(p.as_str()),
                    _ => {}
                }
            }
            Some(Delimiter::new(text?, mode))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_section() {
        assert_eq!(
            Directive::parse("SECTION \"Creating tables\""),
            Some(Directive::Section {
                level: 1,
                message: "Creating tables".into()
            })
        );
        assert_eq!(
            Directive::parse("section.2 \"Indexes\""),
            Some(Directive::Section {
                level: 2,
                message: "Indexes".into()
            })
        );
    }

    #[test]
    fn test_parse_delimiters() {
        assert_eq!(
            Directive::parse("SET DELIMITER ISOLATED GO OR TRAILING ;"),
            Some(Directive::SetDelimiter(vec![
                Delimiter::new("GO", DelimiterMode::Isolated),
                Delimiter::new(";", DelimiterMode::Trailing),
            ]))
        );
        assert_eq!(
            Directive::parse("DELIMITER IS ;"),
            Some(Directive::SetDelimiter(vec![Delimiter::new(";", DelimiterMode::Free)]))
        );
        assert_eq!(Directive::parse("RESET DELIMITER"), Some(Directive::ResetDelimiter));
    }

    #[test]
    fn test_parse_ignore() {
        assert_eq!(
            Directive::parse("IGNORE SQL ERROR SQLITE_CONSTRAINT, 1"),
            Some(Directive::IgnoreSqlError(vec![
                "SQLITE_CONSTRAINT".into(),
                "1".into()
            ]))
        );
        assert_eq!(Directive::parse("END IGNORE"), Some(Directive::EndIgnore));
        assert_eq!(Directive::parse("/IGNORE SQL ERROR"), Some(Directive::EndIgnore));
    }

    #[test]
    fn test_parse_conditionals() {
        assert_eq!(
            Directive::parse("IF SCRIPT env == \"test\""),
            Some(Directive::IfScript("env == \"test\"".into()))
        );
        assert_eq!(
            Directive::parse("IF HISTORY NOT CONTAINS \"1.1\""),
            Some(Directive::IfHistory {
                negated: true,
                version: "1.1".into()
            })
        );
        assert_eq!(Directive::parse("ELSE"), Some(Directive::Else));
        assert_eq!(Directive::parse("END IF"), Some(Directive::EndIf));
        assert_eq!(Directive::parse("/IF"), Some(Directive::EndIf));
        assert_eq!(Directive::parse("SKIP"), Some(Directive::Skip));
        assert_eq!(Directive::parse("/SKIP"), Some(Directive::EndSkip));
        assert_eq!(Directive::parse("END SKIP"), Some(Directive::EndSkip));
    }

    #[test]
    fn test_parse_connection_directives() {
        assert_eq!(
            Directive::parse("SET USER reporting"),
            Some(Directive::SetUser("reporting".into()))
        );
        assert_eq!(
            Directive::parse("USE CONNECTION audit"),
            Some(Directive::SelectConnection("audit".into()))
        );
        assert_eq!(
            Directive::parse("select connection default"),
            Some(Directive::SelectConnection("default".into()))
        );
        assert_eq!(
            Directive::parse("JDBC ESCAPE PROCESSING OFF"),
            Some(Directive::EscapeProcessing(false))
        );
        assert_eq!(
            Directive::parse("SET COMMIT_STRATEGY = AUTOCOMMIT"),
            Some(Directive::SetCommitStrategy(CommitStrategy::Autocommit))
        );
        assert_eq!(
            Directive::parse("RESET COMMIT_STRATEGY"),
            Some(Directive::ResetCommitStrategy)
        );
        assert_eq!(Directive::parse("SESSIONCONFIG"), Some(Directive::Transient));
        assert_eq!(Directive::parse("/TRANSIENT"), Some(Directive::EndTransient));
        assert_eq!(
            Directive::parse("ENCODING \"ISO-8859-1\""),
            Some(Directive::Encoding("ISO-8859-1".into()))
        );
    }

    #[test]
    fn test_parse_unknown() {
        assert_eq!(Directive::parse("FROBNICATE"), None);
        assert_eq!(Directive::parse("SECTION no quotes"), None);
        assert_eq!(Directive::parse("SKIP NOW"), None);
    }

    #[test]
    fn test_parse_patch_headers() {
        assert_eq!(
            PatchHeader::parse_segment_start("UPGRADE OPEN \"\" --> \"1.0\""),
            Some(PatchHeader {
                patch_type: PatchType::Upgrade,
                open: true,
                source: None,
                target: "1.0".into()
            })
        );
        assert_eq!(
            PatchHeader::parse_segment_start("branch \"1.0\" --> \"1.0.1\" // hotfix line"),
            Some(PatchHeader {
                patch_type: PatchType::Switch,
                open: false,
                source: Some("1.0".into()),
                target: "1.0.1".into()
            })
        );
        assert_eq!(PatchHeader::parse_segment_start("UPGRADE \"1.0\""), None);
        assert!(is_segment_end("/UPGRADE"));
        assert!(is_segment_end("END PATCH"));
        assert!(!is_segment_end("END IF"));
    }

    #[test]
    fn test_parse_definition_lines() {
        assert_eq!(DefinitionLine::parse("DEFINITION"), Some(DefinitionLine::Start));
        assert_eq!(DefinitionLine::parse("/DEFINITION"), Some(DefinitionLine::End));
        assert_eq!(DefinitionLine::parse("END DEFINITION"), Some(DefinitionLine::End));
        assert_eq!(
            DefinitionLine::parse("VERSION TABLE APP_VERSION LOG TABLE APP_LOG"),
            Some(DefinitionLine::ControlTables {
                version_table: "APP_VERSION".into(),
                log_table: "APP_LOG".into()
            })
        );
        assert_eq!(
            DefinitionLine::parse("SET DELIMITER TRAILING ;"),
            Some(DefinitionLine::Delimiters(vec![Delimiter::new(
                ";",
                DelimiterMode::Trailing
            )]))
        );
        assert!(matches!(
            DefinitionLine::parse("SETUP \"\" --> \"1.1\""),
            Some(DefinitionLine::Patch(_))
        ));
        assert_eq!(DefinitionLine::parse("UPGRADE \"\" -> \"1.1\""), None);
    }

    #[test]
    fn test_parse_special_commands() {
        assert_eq!(parse_run("RUN \"data/users.sql\""), Some("data/users.sql".into()));
        assert_eq!(parse_run("RUNNING"), None);

        assert_eq!(
            AssertCommand::parse("ASSERT EMPTY MESSAGE \"Orphans found\"\nSELECT * FROM child"),
            Some(AssertCommand {
                mode: AssertMode::Empty,
                message: "Orphans found".into(),
                query: "SELECT * FROM child".into()
            })
        );
        assert_eq!(AssertCommand::parse("ASSERT EXISTS SELECT 1"), None);

        assert_eq!(
            parse_print("PRINT SELECT 'done'"),
            Some("SELECT 'done'".into())
        );
        assert_eq!(parse_print("PRINT 'done'"), None);
    }
}
