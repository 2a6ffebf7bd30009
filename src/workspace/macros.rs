//! Build-variable macro expansion

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::collections::HashMap;

use crate::core::traits::VariableExpansion;

lazy_static! {
    /// `${NAME}` (NAME may contain dots, e.g. `${env.BUILD_ID}`) or `$NAME`
    static ref MACRO: Regex =
        Regex::new(r"\$\{([A-Za-z0-9_.]+)\}|\$([A-Za-z0-9_]+)").unwrap();
}

/// Expands `${NAME}` and `$NAME` macros from build variables
///
/// Unknown macros are left as written so a misconfigured bucket name stays
/// recognisable in the report. Substituted values are not expanded again.
#[derive(Debug, Clone, Copy, Default)]
pub struct MacroExpander;

impl MacroExpander {
    pub fn new() -> Self {
        Self
    }
}

impl VariableExpansion for MacroExpander {
    fn expand(&self, template: &str, vars: &HashMap<String, String>) -> String {
        if !template.contains('$') {
            return template.to_string();
        }

        MACRO
            .replace_all(template, |caps: &Captures| {
                let name = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
                match vars.get(name) {
                    Some(value) => value.clone(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }
}
