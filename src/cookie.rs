//! `Set-Cookie` attribute rewriting.

/// Rewrite rules for one cookie attribute (`Domain` or `Path`).
///
/// Rules are matched against the attribute's current value; `"*"` matches
/// anything not matched explicitly. Rewriting to an empty string removes the
/// attribute.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CookieRewrite {
    rules: Vec<(String, String)>,
}

impl CookieRewrite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite every value of the attribute to `value`.
    pub fn all(value: impl Into<String>) -> Self {
        Self::new().rule("*", value)
    }

    /// Rewrite `from` to `to`. Use `"*"` as `from` for the fallback rule.
    pub fn rule(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.rules.push((from.into(), to.into()));
        self
    }

    fn lookup(&self, previous: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|(from, _)| from == previous)
            .or_else(|| self.rules.iter().find(|(from, _)| from == "*"))
            .map(|(_, to)| to.as_str())
    }
}

impl From<&str> for CookieRewrite {
    fn from(value: &str) -> Self {
        CookieRewrite::all(value)
    }
}

impl From<String> for CookieRewrite {
    fn from(value: String) -> Self {
        CookieRewrite::all(value)
    }
}

/// Rewrite the first `property=value` attribute of a `Set-Cookie` value.
///
/// The cookie's own `name=value` pair is never touched. Values without a
/// matching rule are left as they are.
pub(crate) fn rewrite_cookie_property(
    header: &str,
    rewrite: &CookieRewrite,
    property: &str,
) -> String {
    let mut segments: Vec<String> = header.split(';').map(str::to_string).collect();
    let prefix_len = property.len() + 1;

    for i in 1..segments.len() {
        let segment = &segments[i];
        let trimmed = segment.trim_start();
        let matches = trimmed
            .get(..property.len())
            .is_some_and(|p| p.eq_ignore_ascii_case(property))
            && trimmed[property.len()..].starts_with('=');
        if !matches || trimmed.len() == prefix_len {
            continue;
        }

        let previous = &trimmed[prefix_len..];
        let Some(next) = rewrite.lookup(previous) else {
            return header.to_string();
        };

        if next.is_empty() {
            segments.remove(i);
        } else {
            let leading = &segment[..segment.len() - trimmed.len()];
            let written_property = &trimmed[..prefix_len];
            let replaced = format!("{leading}{written_property}{next}");
            segments[i] = replaced;
        }
        return segments.join(";");
    }

    header.to_string()
}

/// Drop every `Secure` attribute from a `Set-Cookie` value.
pub(crate) fn remove_secure(header: &str) -> String {
    let mut segments = header.split(';');
    let mut out = segments.next().unwrap_or_default().to_string();
    for segment in segments {
        if segment.trim().eq_ignore_ascii_case("secure") {
            continue;
        }
        out.push(';');
        out.push_str(segment);
    }
    out
}
