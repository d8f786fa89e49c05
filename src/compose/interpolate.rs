//! `${VAR}` / `${VAR:-default}` resolution. The parser never interpolates;
//! this runs at redeploy and replay time. Precedence: provided map, then
//! process environment, then the default; unresolved placeholders become
//! empty strings.

use std::collections::HashMap;

pub fn interpolate(input: &str, env: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                out.push_str(&resolve(&after[..end], env));
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated placeholder; pass through verbatim.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn resolve(expr: &str, env: &HashMap<String, String>) -> String {
    let (name, default) = match expr.split_once(":-") {
        Some((name, default)) => (name, Some(default)),
        None => (expr, None),
    };
    if let Some(v) = env.get(name) {
        return v.clone();
    }
    if let Ok(v) = std::env::var(name) {
        return v;
    }
    default.unwrap_or("").to_string()
}

/// Parse `.env`-style `K=V` lines, skipping blanks and `#` comments.
pub fn parse_env_lines(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_takes_precedence() {
        std::env::set_var("STACKVAULT_TEST_VAR", "from-process");
        let mut env = HashMap::new();
        env.insert("STACKVAULT_TEST_VAR".to_string(), "from-map".to_string());
        assert_eq!(interpolate("${STACKVAULT_TEST_VAR}", &env), "from-map");
        assert_eq!(interpolate("${STACKVAULT_TEST_VAR}", &HashMap::new()), "from-process");
        std::env::remove_var("STACKVAULT_TEST_VAR");
    }

    #[test]
    fn test_default_and_empty_fallback() {
        let env = HashMap::new();
        assert_eq!(interpolate("${NO_SUCH_VAR:-fallback}", &env), "fallback");
        assert_eq!(interpolate("${NO_SUCH_VAR}", &env), "");
        assert_eq!(interpolate("pre-${NO_SUCH_VAR:-x}-post", &env), "pre-x-post");
    }

    #[test]
    fn test_unterminated_placeholder_passes_through() {
        assert_eq!(interpolate("${BROKEN", &HashMap::new()), "${BROKEN");
    }

    #[test]
    fn test_parse_env_lines() {
        let parsed = parse_env_lines("# comment\nA=1\n\nB=two=halves\n");
        assert_eq!(parsed.get("A").unwrap(), "1");
        assert_eq!(parsed.get("B").unwrap(), "two=halves");
        assert_eq!(parsed.len(), 2);
    }
}
