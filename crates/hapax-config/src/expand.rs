//! Environment-variable substitution for config files (§4.7, §6).
//!
//! Supports `${VAR}` (empty string if unset) and `${VAR:-default}` (literal
//! default if unset, *not* if set-but-empty — §8 testable invariant). An
//! unclosed `${` is a parse error whose message contains "invalid syntax".

/// Expand `${VAR}` / `${VAR:-default}` occurrences in `input` against `env`.
pub fn expand(input: &str, env: &impl Fn(&str) -> Option<String>) -> Result<String, String> {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            let close = input[i + 2..]
                .find('}')
                .map(|p| i + 2 + p)
                .ok_or_else(|| {
                    format!(
                        "invalid syntax: unterminated \"${{\" starting at byte {i} in config"
                    )
                })?;
            let inner = &input[i + 2..close];
            let (name, default) = match inner.split_once(":-") {
                Some((n, d)) => (n, Some(d)),
                None => (inner, None),
            };
            let value = env(name);
            match (value, default) {
                (Some(v), _) => out.push_str(&v),
                (None, Some(d)) => out.push_str(d),
                (None, None) => {}
            }
            i = close + 1;
        } else {
            // `$` is ASCII, so scanning for it byte-by-byte never lands
            // inside a multi-byte UTF-8 sequence; but the non-`$` span we
            // copy through may contain one, so push it whole rather than
            // reinterpreting individual bytes as codepoints.
            let next_dollar = input[i..]
                .find('$')
                .map(|p| i + p)
                .unwrap_or(input.len());
            out.push_str(&input[i..next_dollar]);
            i = next_dollar;
        }
    }

    Ok(out)
}

/// Expand against the real process environment.
pub fn expand_process_env(input: &str) -> Result<String, String> {
    expand(input, &|name| std::env::var(name).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_map(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(expand("hello world", &env_map(&[])).unwrap(), "hello world");
    }

    #[test]
    fn missing_var_expands_to_empty() {
        assert_eq!(expand("${X}", &env_map(&[])).unwrap(), "");
    }

    #[test]
    fn set_var_expands_to_value() {
        assert_eq!(expand("${X}", &env_map(&[("X", "val")])).unwrap(), "val");
    }

    #[test]
    fn empty_env_var_does_not_trigger_default() {
        // expand("${X:-d}", X ↦ "") = "" — an empty env var is still "set".
        assert_eq!(expand("${X:-d}", &env_map(&[("X", "")])).unwrap(), "");
    }

    #[test]
    fn undefined_var_triggers_default() {
        assert_eq!(expand("${X:-d}", &env_map(&[])).unwrap(), "d");
    }

    #[test]
    fn unclosed_brace_is_a_parse_error() {
        let err = expand("port = ${PORT", &env_map(&[])).unwrap_err();
        assert!(err.contains("invalid syntax"));
    }

    #[test]
    fn multiple_substitutions_in_one_line() {
        let result = expand(
            "${HOST}:${PORT:-8080}",
            &env_map(&[("HOST", "example.com")]),
        )
        .unwrap();
        assert_eq!(result, "example.com:8080");
    }

    #[test]
    fn non_ascii_text_outside_substitutions_is_preserved() {
        let result = expand("system_prompt = \"caf\u{e9} \u{2014} ${NAME}\"", &env_map(&[("NAME", "world")])).unwrap();
        assert_eq!(result, "system_prompt = \"caf\u{e9} \u{2014} world\"");
    }
}
