//! `${VAR}` / `${VAR:default}` expansion for user-facing configuration text.
//!
//! Expansion happens on the raw document before it is parsed, so variables can
//! appear anywhere a YAML scalar can.

/// Expands `${VAR}` and `${VAR:default}` references against the process
/// environment. A variable that is unset and carries no default expands to the
/// empty string. `$` not followed by `{` passes through untouched.
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if c != '$' || !matches!(chars.peek(), Some((_, '{'))) {
            out.push(c);
            continue;
        }
        // Consume '{'
        chars.next();

        let Some(end) = input[i..].find('}').map(|off| i + off) else {
            // Unterminated reference, keep the raw text
            out.push_str(&input[i..]);
            break;
        };

        let body = &input[i + 2..end];
        let (name, default) = match body.split_once(':') {
            Some((name, default)) => (name, Some(default)),
            None => (body, None),
        };

        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => out.push_str(default.unwrap_or("")),
        }

        // Skip past the consumed reference body and closing brace
        while let Some((j, _)) = chars.peek() {
            if *j > end {
                break;
            }
            chars.next();
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_set_variables() {
        // Safety: test-only env mutation, no concurrent readers of this key
        unsafe { std::env::set_var("SHARED_ENV_TEST_HOST", "backend.local") };
        assert_eq!(
            expand_env("url: http://${SHARED_ENV_TEST_HOST}/echo"),
            "url: http://backend.local/echo"
        );
    }

    #[test]
    fn falls_back_to_default() {
        assert_eq!(
            expand_env("${SHARED_ENV_TEST_UNSET_XYZ:fallback}"),
            "fallback"
        );
    }

    #[test]
    fn unset_without_default_is_empty() {
        assert_eq!(expand_env("a${SHARED_ENV_TEST_UNSET_XYZ}b"), "ab");
    }

    #[test]
    fn plain_dollars_untouched() {
        assert_eq!(expand_env("cost: $5 and $x"), "cost: $5 and $x");
        assert_eq!(expand_env("${unterminated"), "${unterminated");
    }

    #[test]
    fn default_may_contain_colon() {
        assert_eq!(
            expand_env("${SHARED_ENV_TEST_UNSET_XYZ:http://h:8080}"),
            "http://h:8080"
        );
    }
}
