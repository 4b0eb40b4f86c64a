//! Key paths into structured step output: `a.b[0].c` or `a|b[0]|c`.

use serde_json::Value;

use crate::error::ValidationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPath {
    segments: Vec<PathSegment>,
}

impl KeyPath {
    /// Parses a path. A single separator (`.` or `|`) must be used consistently;
    /// one leading separator is tolerated.
    pub fn parse(path: &str) -> Result<Self, ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidKeyPath {
            path: path.to_string(),
            reason: reason.to_string(),
        };

        let separator = match (path.contains('.'), path.contains('|')) {
            (true, true) => return Err(invalid("mixed '.' and '|' separators")),
            (false, true) => '|',
            _ => '.',
        };

        let body = path.strip_prefix(separator).unwrap_or(path);
        if body.is_empty() {
            return Err(invalid("empty path"));
        }

        let mut segments = Vec::new();
        for part in body.split(separator) {
            let (key, mut rest) = match part.find('[') {
                Some(pos) => (&part[..pos], &part[pos..]),
                None => (part, ""),
            };

            if key.is_empty() && (rest.is_empty() || !segments.is_empty()) {
                return Err(invalid("empty key"));
            }
            if !key.is_empty() {
                segments.push(PathSegment::Key(key.to_string()));
            }

            while !rest.is_empty() {
                let Some(inner) = rest.strip_prefix('[') else {
                    return Err(invalid("unexpected characters after index"));
                };
                let Some(end) = inner.find(']') else {
                    return Err(invalid("unterminated index"));
                };
                let index = inner[..end]
                    .parse::<usize>()
                    .map_err(|_| invalid("index is not a non-negative integer"))?;
                segments.push(PathSegment::Index(index));
                rest = &inner[end + 1..];
            }
        }

        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn lookup<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(value, |current, segment| match segment {
                PathSegment::Key(key) => current.as_object()?.get(key),
                PathSegment::Index(index) => current.as_array()?.get(*index),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_dotted() {
        let path = KeyPath::parse("credentials[0].username").unwrap();
        assert_eq!(
            path.segments(),
            &[
                PathSegment::Key("credentials".to_string()),
                PathSegment::Index(0),
                PathSegment::Key("username".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_piped_with_leading_separator() {
        let path = KeyPath::parse("|a|b[2][1]").unwrap();
        assert_eq!(
            path.segments(),
            &[
                PathSegment::Key("a".to_string()),
                PathSegment::Key("b".to_string()),
                PathSegment::Index(2),
                PathSegment::Index(1),
            ]
        );
    }

    #[test]
    fn test_leading_index() {
        let path = KeyPath::parse("[1].name").unwrap();
        let value = json!([{"name": "a"}, {"name": "b"}]);
        assert_eq!(path.lookup(&value), Some(&json!("b")));
    }

    #[test]
    fn test_rejects_mixed_separators() {
        assert!(KeyPath::parse("a.b|c").is_err());
        assert!(KeyPath::parse("a..b").is_err());
        assert!(KeyPath::parse("a[x]").is_err());
        assert!(KeyPath::parse("").is_err());
    }

    #[test]
    fn test_lookup() {
        let value = json!({"credentials": [{"username": "u", "password": "p"}], "port": 22});
        let path = KeyPath::parse("credentials[0].username").unwrap();
        assert_eq!(path.lookup(&value), Some(&json!("u")));

        let path = KeyPath::parse("port").unwrap();
        assert_eq!(path.lookup(&value), Some(&json!(22)));

        let path = KeyPath::parse("credentials[3].username").unwrap();
        assert_eq!(path.lookup(&value), None);

        let path = KeyPath::parse("port.value").unwrap();
        assert_eq!(path.lookup(&value), None);
    }
}
