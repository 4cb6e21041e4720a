//! Route path patterns: parsing, matching and specificity ranking.
//!
//! Pattern syntax:
//! - `literal` matches the segment exactly (case-sensitive)
//! - `:name` matches exactly one non-empty segment
//! - `:name*` matches one or more trailing segments (last position only)

use std::{cmp::Reverse, fmt};

use crate::error::ManifestError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Param(String),
    CatchAll(String),
}

/// Named parameters captured while matching a path, in pattern order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathParams(Vec<(String, String)>);

impl PathParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A compiled route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    raw: String,
    segments: Vec<Segment>,
}

impl RoutePattern {
    pub fn parse(raw: &str) -> Result<Self, ManifestError> {
        let invalid = |reason: &str| ManifestError::InvalidPattern {
            path: raw.to_string(),
            reason: reason.to_string(),
        };

        if !raw.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }

        let parts: Vec<&str> = split_path(raw).collect();
        let mut segments = Vec::with_capacity(parts.len());
        for (idx, part) in parts.iter().enumerate() {
            let Some(name) = part.strip_prefix(':') else {
                segments.push(Segment::Literal((*part).to_string()));
                continue;
            };
            let (name, catch_all) = match name.strip_suffix('*') {
                Some(stripped) => (stripped, true),
                None => (name, false),
            };
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(invalid("parameter names must be non-empty [A-Za-z0-9_]"));
            }
            if segments.iter().any(|s| param_name(s) == Some(name)) {
                return Err(invalid("parameter name used twice"));
            }
            if catch_all {
                if idx + 1 != parts.len() {
                    return Err(invalid("catch-all parameter must be the last segment"));
                }
                segments.push(Segment::CatchAll(name.to_string()));
            } else {
                segments.push(Segment::Param(name.to_string()));
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Structural signature with parameter names erased. Two patterns with
    /// the same signature can never be told apart at request time.
    pub fn signature(&self) -> String {
        let mut sig = String::new();
        for segment in &self.segments {
            sig.push('/');
            match segment {
                Segment::Literal(lit) => sig.push_str(lit),
                Segment::Param(_) => sig.push(':'),
                Segment::CatchAll(_) => sig.push('*'),
            }
        }
        if sig.is_empty() {
            sig.push('/');
        }
        sig
    }

    /// Number of parameters this pattern captures.
    pub fn param_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| !matches!(s, Segment::Literal(_)))
            .count()
    }

    /// Length of the path with every parameter segment stripped.
    pub fn literal_len(&self) -> usize {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Literal(lit) => lit.len() + 1,
                _ => 0,
            })
            .sum()
    }

    /// Match a request path (query string and trailing slash ignored).
    pub fn matches(&self, path: &str) -> Option<PathParams> {
        let parts: Vec<&str> = split_path(strip_query(path)).collect();
        let mut params = Vec::new();

        for (idx, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Literal(lit) => {
                    if parts.get(idx) != Some(&lit.as_str()) {
                        return None;
                    }
                },
                Segment::Param(name) => {
                    let value = parts.get(idx)?;
                    params.push((name.clone(), decode(value)));
                },
                Segment::CatchAll(name) => {
                    let rest = parts.get(idx..).filter(|rest| !rest.is_empty())?;
                    let joined = rest.iter().map(|p| decode(p)).collect::<Vec<_>>().join("/");
                    params.push((name.clone(), joined));
                    return Some(PathParams(params));
                },
            }
        }

        (parts.len() == self.segments.len()).then_some(PathParams(params))
    }

    /// Sort key: fewer parameters first, then longer literal path first.
    pub fn rank(&self) -> (usize, Reverse<usize>) {
        (self.param_count(), Reverse(self.literal_len()))
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn param_name(segment: &Segment) -> Option<&str> {
    match segment {
        Segment::Param(name) | Segment::CatchAll(name) => Some(name),
        Segment::Literal(_) => None,
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn strip_query(path: &str) -> &str {
    path.split_once(['?', '#']).map_or(path, |(p, _)| p)
}

fn decode(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn pattern(raw: &str) -> RoutePattern {
        RoutePattern::parse(raw).unwrap()
    }

    #[rstest]
    #[case("/users/:id", "/users/42", Some(vec![("id", "42")]))]
    #[case("/users/:id", "/users/42/", Some(vec![("id", "42")]))]
    #[case("/users/:id", "/users/42?expand=true", Some(vec![("id", "42")]))]
    #[case("/users/:id", "/users", None)]
    #[case("/users/:id", "/users/42/posts", None)]
    #[case("/files/:path*", "/files/a/b/c.txt", Some(vec![("path", "a/b/c.txt")]))]
    #[case("/files/:path*", "/files", None)]
    #[case("/", "/", Some(vec![]))]
    #[case("/", "/anything", None)]
    #[case("/search/:term", "/search/hello%20world", Some(vec![("term", "hello world")]))]
    fn matches_paths(
        #[case] raw: &str,
        #[case] path: &str,
        #[case] expected: Option<Vec<(&str, &str)>>,
    ) {
        let got = pattern(raw).matches(path);
        let got: Option<Vec<(&str, &str)>> = got.as_ref().map(|p| p.iter().collect());
        assert_eq!(got, expected);
    }

    #[rstest]
    #[case("users")]
    #[case("/files/:path*/meta")]
    #[case("/a/:")]
    #[case("/a/:id/:id")]
    #[case("/a/:bad-name")]
    fn rejects_invalid(#[case] raw: &str) {
        assert!(matches!(
            RoutePattern::parse(raw),
            Err(ManifestError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn signature_erases_param_names() {
        assert_eq!(
            pattern("/projects/:id/tasks/:task").signature(),
            pattern("/projects/:project/tasks/:n").signature()
        );
        assert_ne!(
            pattern("/projects/:id").signature(),
            pattern("/projects/:id*").signature()
        );
        assert_eq!(pattern("/").signature(), "/");
    }

    #[test]
    fn literal_route_outranks_catch_all() {
        let literal = pattern("/files/readme");
        let catch_all = pattern("/files/:path*");
        assert!(literal.rank() < catch_all.rank());
    }

    #[test]
    fn longer_literal_wins_param_tie() {
        let deep = pattern("/api/v1/users/:id");
        let shallow = pattern("/api/:version/users");
        assert_eq!(deep.param_count(), shallow.param_count());
        assert!(deep.rank() < shallow.rank());
    }
}
