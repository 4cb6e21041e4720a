/// Replace `${ENV_VAR}` and `${ENV_VAR:-fallback}` placeholders in raw config text.
///
/// Variables that are unset and carry no fallback are left as-is so the
/// parser reports them in context instead of silently seeing an empty value.
pub fn substitute_env(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated: emit the remainder literally.
            result.push_str(&rest[start..]);
            return result;
        };

        let body = &after[..end];
        let (name, fallback) = match body.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (body, None),
        };

        let value = is_var_name(name)
            .then(|| std::env::var(name).ok())
            .flatten();
        match (value, fallback) {
            (Some(value), _) => result.push_str(&value),
            (None, Some(fallback)) if is_var_name(name) => result.push_str(fallback),
            _ => {
                result.push_str("${");
                result.push_str(body);
                result.push('}');
            },
        }
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    result
}

fn is_var_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_var() {
        let path = std::env::var("PATH").unwrap_or_default();
        assert_eq!(substitute_env("p=${PATH}"), format!("p={path}"));
    }

    #[test]
    fn leaves_unknown_var() {
        assert_eq!(
            substitute_env("${SWITCHYARD_NONEXISTENT_XYZ}"),
            "${SWITCHYARD_NONEXISTENT_XYZ}"
        );
    }

    #[test]
    fn uses_fallback_for_unknown_var() {
        assert_eq!(
            substitute_env("port = ${SWITCHYARD_NONEXISTENT_PORT:-8080}"),
            "port = 8080"
        );
    }

    #[test]
    fn unterminated_placeholder_is_literal() {
        assert_eq!(substitute_env("a ${OOPS"), "a ${OOPS");
    }

    #[test]
    fn no_placeholders() {
        assert_eq!(substitute_env("plain text"), "plain text");
    }
}
