//! `$VAR` / `${VAR}` expansion applied to the descriptor before parsing.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::{Captures, Regex};

static VARIABLE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").ok()
});

/// Replaces every variable reference in `raw` using `lookup`. Unknown
/// variables expand to the empty string; a `$` not followed by a name is
/// left untouched.
pub fn expand_variables<'a, F>(raw: &'a str, lookup: F) -> Cow<'a, str>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(pattern) = VARIABLE.as_ref() else {
        return Cow::Borrowed(raw);
    };
    pattern.replace_all(raw, |captures: &Captures<'_>| {
        captures
            .get(1)
            .or_else(|| captures.get(2))
            .and_then(|name| lookup(name.as_str()))
            .unwrap_or_default()
    })
}

/// Expands variables from the process environment.
#[must_use]
pub fn expand_from_env(raw: &str) -> Cow<'_, str> {
    expand_variables(raw, |name| std::env::var(name).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "DB_PASSWORD" => Some(String::from("s3cret")),
            "HOME" => Some(String::from("/home/app")),
            _ => None,
        }
    }

    #[rstest]
    #[case("password: ${DB_PASSWORD}", "password: s3cret")]
    #[case("path: $HOME/data", "path: /home/app/data")]
    #[case("missing: '${NOT_SET}'", "missing: ''")]
    #[case("price: 5$ total", "price: 5$ total")]
    #[case("plain: value", "plain: value")]
    fn expands_known_and_unknown_references(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(expand_variables(raw, lookup), expected);
    }
}
