//! Route template compiler and matcher.
//!
//! A template such as `/exames/<id:int>/marcar` is compiled into an anchored
//! [`Regex`] whose capture groups line up, in declaration order, with a list
//! of typed [`ParamSpec`]s. Matching a path re-associates each capture with
//! its declared name and converts it with [`convert`].
//!
//! | Tag                       | Captures                          |
//! |---------------------------|-----------------------------------|
//! | `int`                     | `[0-9]+`                          |
//! | `str`                     | one or more non-`/` characters    |
//! | `float`                   | `[0-9]+\.[0-9]+`                  |
//! | `list`, `list[str]`       | comma-separated non-`/` tokens    |
//! | `list[int]`               | comma-separated integers          |
//! | `list[float]`             | comma-separated decimals          |
//! | `dict`                    | comma-separated `key=value` pairs |

use regex::Regex;
use thiserror::Error;

use super::value::{ParamError, ParamType, convert};
use crate::context::Params;

/// Errors raised while compiling a route template. These are startup
/// failures: a router holding an invalid template is never built.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("unknown parameter type {tag:?} for <{name}> in route {template:?}")]
    InvalidRouteType {
        template: String,
        name: String,
        tag: String,
    },

    #[error("parameter <{name}> declared twice in route {template:?}")]
    DuplicateParam { template: String, name: String },

    #[error("route {template:?} did not compile: {source}")]
    Regex {
        template: String,
        #[source]
        source: regex::Error,
    },
}

/// One declared placeholder: its name and type, in capture order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: String,
    pub ty: ParamType,
}

/// An immutable, anchored matcher compiled from a route template.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    template: String,
    regex: Regex,
    params: Vec<ParamSpec>,
}

impl CompiledPattern {
    /// Compiles `template`.
    ///
    /// # Errors
    ///
    /// - [`RouteError::InvalidRouteType`] for a tag outside the supported set.
    /// - [`RouteError::DuplicateParam`] when a name is declared twice.
    ///
    /// # Examples
    ///
    /// ```
    /// use tandem::router::pattern::CompiledPattern;
    ///
    /// let pattern = CompiledPattern::compile("/x/<id:int>/<n:float>").unwrap();
    /// let params = pattern.matches("/x/7/3.5").unwrap().unwrap();
    /// assert_eq!(params.get::<i64>("id").unwrap(), 7);
    /// assert_eq!(params.get::<f64>("n").unwrap(), 3.5);
    ///
    /// assert!(pattern.matches("/x/7/3.5/extra").unwrap().is_none());
    /// assert!(CompiledPattern::compile("/x/<id:uuid>").is_err());
    /// ```
    pub fn compile(template: &str) -> Result<Self, RouteError> {
        let mut source = String::with_capacity(template.len() + 16);
        source.push('^');
        let mut params: Vec<ParamSpec> = Vec::new();

        let mut rest = template;
        while let Some(open) = rest.find('<') {
            let (literal, tail) = rest.split_at(open);
            source.push_str(&regex::escape(literal));

            let Some((name, tag, after)) = split_placeholder(tail) else {
                source.push_str(&regex::escape("<"));
                rest = &tail[1..];
                continue;
            };

            let ty = ParamType::from_route_tag(tag).ok_or_else(|| RouteError::InvalidRouteType {
                template: template.to_owned(),
                name: name.to_owned(),
                tag: tag.to_owned(),
            })?;
            if params.iter().any(|p| p.name == name) {
                return Err(RouteError::DuplicateParam {
                    template: template.to_owned(),
                    name: name.to_owned(),
                });
            }

            source.push_str(capture_for(&ty));
            params.push(ParamSpec {
                name: name.to_owned(),
                ty,
            });
            rest = after;
        }
        source.push_str(&regex::escape(rest));
        source.push('$');

        let regex = Regex::new(&source).map_err(|source| RouteError::Regex {
            template: template.to_owned(),
            source,
        })?;

        Ok(Self {
            template: template.to_owned(),
            regex,
            params,
        })
    }

    /// The template this pattern was compiled from.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Declared parameters in capture order.
    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Structural test only: does the whole path fit the pattern?
    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    /// Matches `path` and converts every capture to its declared type.
    ///
    /// Returns `Ok(None)` when the path does not fit the pattern at all, and
    /// `Err` when it fits but a capture fails conversion.
    pub fn matches(&self, path: &str) -> Result<Option<Params>, ParamError> {
        let Some(captures) = self.regex.captures(path) else {
            return Ok(None);
        };

        let mut params = Params::new();
        for (index, spec) in self.params.iter().enumerate() {
            let raw = captures.get(index + 1).map_or("", |m| m.as_str());
            params.insert(spec.name.clone(), convert(&spec.ty, raw)?);
        }
        Ok(Some(params))
    }
}

// Splits `<name:tag>rest` into its parts. `name` must be a non-empty run of
// word characters; anything else is not a placeholder.
fn split_placeholder(s: &str) -> Option<(&str, &str, &str)> {
    let inner_end = s.find('>')?;
    let inner = &s[1..inner_end];
    let (name, tag) = inner.split_once(':')?;
    let is_word = |c: char| c.is_ascii_alphanumeric() || c == '_';
    if name.is_empty() || !name.chars().all(is_word) || tag.is_empty() {
        return None;
    }
    Some((name, tag, &s[inner_end + 1..]))
}

fn capture_for(ty: &ParamType) -> &'static str {
    match ty {
        ParamType::Int => r"([0-9]+)",
        ParamType::Float => r"([0-9]+\.[0-9]+)",
        ParamType::List(inner) => match **inner {
            ParamType::Int => r"((?:[0-9]+,)*[0-9]+)",
            ParamType::Float => r"((?:[0-9]+\.[0-9]+,)*[0-9]+\.[0-9]+)",
            _ => r"((?:[^/]+,)*[^/]+)",
        },
        ParamType::Dict => r"((?:[^/]+,)*[^/]+)",
        _ => r"([^/]+)",
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::router::value::Value;

    #[test]
    fn literal_template_is_escaped_and_anchored() {
        let p = CompiledPattern::compile("/v1.0/items/").unwrap();
        assert!(p.is_match("/v1.0/items/"));
        assert!(!p.is_match("/v1x0/items/"));
        assert!(!p.is_match("/v1.0/items/extra"));
        assert!(!p.is_match("/prefix/v1.0/items/"));
        assert!(p.params().is_empty());
    }

    #[test]
    fn captures_follow_declaration_order() {
        let p = CompiledPattern::compile("/teste/<id_1:int>/teste/<id_2:int>/").unwrap();
        let names: Vec<_> = p.params().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["id_1", "id_2"]);

        let params = p.matches("/teste/5/teste/9/").unwrap().unwrap();
        assert_eq!(params.get::<i64>("id_1").unwrap(), 5);
        assert_eq!(params.get::<i64>("id_2").unwrap(), 9);
    }

    #[test]
    fn wrong_arity_is_no_match() {
        let p = CompiledPattern::compile("/hello/<name:str>/").unwrap();
        assert!(p.matches("/hello/").unwrap().is_none());
        assert!(p.matches("/hello/ana/maria/").unwrap().is_none());
        assert!(p.matches("/hello/ana").unwrap().is_none());
        assert!(p.matches("/hello/ana/").unwrap().is_some());
    }

    #[test]
    fn int_does_not_match_text() {
        let p = CompiledPattern::compile("/exames/<id:int>/marcar").unwrap();
        assert!(p.matches("/exames/abc/marcar").unwrap().is_none());
        assert!(p.matches("/exames/12/marcar").unwrap().is_some());
    }

    #[test]
    fn list_types() {
        let p = CompiledPattern::compile("/l/<a:list[int]>/<b:list[float]>/<c:list>").unwrap();
        let params = p.matches("/l/1,2,3/1.5,2.0/x,y").unwrap().unwrap();
        assert_eq!(params.get::<Vec<i64>>("a").unwrap(), vec![1, 2, 3]);
        assert_eq!(params.get::<Vec<f64>>("b").unwrap(), vec![1.5, 2.0]);
        assert_eq!(
            params.get::<Vec<String>>("c").unwrap(),
            vec!["x".to_owned(), "y".to_owned()]
        );
        assert!(p.matches("/l/1,a/1.5/x").unwrap().is_none());
    }

    #[test]
    fn dict_param() {
        let p = CompiledPattern::compile("/f/<d:dict>").unwrap();
        let params = p.matches("/f/a=1,b=2").unwrap().unwrap();
        let expected: BTreeMap<String, String> =
            [("a".into(), "1".into()), ("b".into(), "2".into())].into();
        assert_eq!(params.value("d"), Some(&Value::Dict(expected)));

        assert_eq!(
            p.matches("/f/a=1,b").unwrap_err(),
            ParamError::MalformedDict { token: "b".into() }
        );
    }

    #[test]
    fn invalid_type_and_duplicates_fail_compilation() {
        assert!(matches!(
            CompiledPattern::compile("/x/<id:uuid>/"),
            Err(RouteError::InvalidRouteType { tag, .. }) if tag == "uuid"
        ));
        assert!(matches!(
            CompiledPattern::compile("/x/<id:int>/<id:str>"),
            Err(RouteError::DuplicateParam { name, .. }) if name == "id"
        ));
    }

    #[test]
    fn stray_angle_brackets_are_literal() {
        let p = CompiledPattern::compile("/a<b/<n:int>").unwrap();
        assert!(p.is_match("/a<b/3"));
        assert_eq!(p.params().len(), 1);
    }

    #[test]
    fn matching_is_repeatable() {
        let p = CompiledPattern::compile("/x/<id:int>/<n:float>").unwrap();
        let first = p.matches("/x/7/3.5").unwrap();
        let second = p.matches("/x/7/3.5").unwrap();
        assert_eq!(first, second);
    }
}
