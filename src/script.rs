use std::collections::BTreeMap;

use pest::iterators::Pair;
use pest::Parser;

use crate::directive::{DirectiveParser, Rule};
use crate::error::UpgradeError;
use crate::source::Location;

/// Evaluates the condition of an `IF SCRIPT` directive.
pub trait ScriptEvaluator: Send {
    fn evaluate(&self, expression: &str, location: &Location) -> Result<bool, UpgradeError>;
}

/// Boolean expressions over a fixed set of string variables:
/// `true`, `false`, `name`, `name == "v"`, `name != "v"`, `!`, `&&`, `||` and parentheses.
///
/// A bare variable is true when it is set to anything other than an empty string,
/// `false`, `0`, `no` or `off`.
#[derive(Debug, Clone, Default)]
pub struct VariableEvaluator {
    variables: BTreeMap<String, String>,
}

impl VariableEvaluator {
    pub fn new(variables: BTreeMap<String, String>) -> Self {
        VariableEvaluator { variables }
    }

    fn truthy(&self, name: &str) -> bool {
        self.variables.get(name).is_some_and(|value| {
            !matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "" | "false" | "0" | "no" | "off"
            )
        })
    }

    fn eval(&self, pair: Pair<'_, Rule>) -> bool {
        match pair.as_rule() {
            Rule::or_expr => pair
                .into_inner()
                .filter(|p| p.as_rule() != Rule::or_op)
                .fold(false, |acc, p| acc | self.eval(p)),
            Rule::and_expr => pair
                .into_inner()
                .filter(|p| p.as_rule() != Rule::and_op)
                .fold(true, |acc, p| acc & self.eval(p)),
            Rule::unary => {
                let mut negations = 0;
                let mut value = false;
                for p in pair.into_inner() {
                    match p.as_rule() {
                        Rule::not_op => negations += 1,
                        _ => value = self.eval(p),
                    }
                }
                value ^ (negations % 2 == 1)
            }
            Rule::primary => pair.into_inner().next().is_some_and(|p| self.eval(p)),
            Rule::comparison => {
                let mut inner = pair.into_inner();
                let (Some(name), Some(op), Some(literal)) = (inner.next(), inner.next(), inner.next())
                else {
                    return false;
                };
                let expected = match literal.as_rule() {
                    Rule::quoted => literal
                        .into_inner()
                        .next()
                        .map(|p| p.as_str())
                        .unwrap_or_default(),
                    _ => literal.as_str(),
                };
                let equal = self.variables.get(name.as_str()).map(String::as_str) == Some(expected);
                if op.as_str() == "==" {
                    equal
                } else {
                    !equal
                }
            }
            Rule::bool_literal => pair.as_str().eq_ignore_ascii_case("true"),
            Rule::variable => self.truthy(pair.as_str()),
            _ => false,
        }
    }
}

impl ScriptEvaluator for VariableEvaluator {
    fn evaluate(&self, expression: &str, location: &Location) -> Result<bool, UpgradeError> {
        let expression_pair = DirectiveParser::parse(Rule::expression, expression)
            .map_err(|err| {
                UpgradeError::source_error(format!("Invalid script expression: {}", err), location)
            })?
            .next()
            .and_then(|p| p.into_inner().next())
            .ok_or_else(|| UpgradeError::source_error("Empty script expression", location))?;

        Ok(self.eval(expression_pair))
    }
}
