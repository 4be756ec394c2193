//! Diagnostic language detection from the gettext locale variables

/// Checked in gettext precedence order
pub const LOCALE_VARIABLES: [&str; 4] = ["LANGUAGE", "LC_ALL", "LC_MESSAGES", "LANG"];

/// Language part of the first non-empty locale variable, e.g. `ja` for
/// `ja_JP.UTF-8`. Empty when none is set.
pub fn language_from<F>(lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    LOCALE_VARIABLES
        .iter()
        .filter_map(|key| lookup(key))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .map(|value| value.split('_').next().unwrap_or_default().to_string())
        .unwrap_or_default()
}

pub fn language_from_env() -> String {
    language_from(|key| std::env::var(key).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_language_from_lang() {
        assert_eq!(language_from(lookup(&[("LANG", "ja_JP.UTF-8")])), "ja");
    }

    #[test]
    fn test_precedence() {
        let vars = lookup(&[("LANG", "ja_JP.UTF-8"), ("LC_ALL", "de_DE.UTF-8")]);
        assert_eq!(language_from(vars), "de");

        let vars = lookup(&[("LANGUAGE", "fr_FR"), ("LC_ALL", "de_DE.UTF-8")]);
        assert_eq!(language_from(vars), "fr");
    }

    #[test]
    fn test_empty_values_are_skipped() {
        let vars = lookup(&[("LANGUAGE", ""), ("LANG", "en_US.UTF-8")]);
        assert_eq!(language_from(vars), "en");
    }

    #[test]
    fn test_unset() {
        assert_eq!(language_from(lookup(&[])), "");
        assert_eq!(language_from(lookup(&[("LANG", "C")])), "C");
    }
}
