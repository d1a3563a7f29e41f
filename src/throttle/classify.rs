//! Request classification predicates.

use std::fmt;
use std::sync::Arc;

use http::request::Parts;
use http::{HeaderName, Method};

type Predicate = dyn Fn(&Parts) -> bool + Send + Sync;

/// Decides whether a throttle rule applies to a request.
///
/// Classifiers see only the request head, so rules work with any body type.
#[derive(Clone)]
pub struct Classifier {
    predicate: Arc<Predicate>,
    description: String,
}

impl Classifier {
    /// Wrap an arbitrary predicate.
    pub fn from_fn<F>(description: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Parts) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(f),
            description: description.into(),
        }
    }

    /// Matches every request.
    pub fn always() -> Self {
        Self::from_fn("any", |_| true)
    }

    /// Matches requests whose method is in `methods`.
    pub fn methods(methods: Vec<Method>) -> Self {
        let description = format!(
            "method in [{}]",
            methods.iter().map(Method::as_str).collect::<Vec<_>>().join(",")
        );
        Self::from_fn(description, move |parts| methods.contains(&parts.method))
    }

    /// Matches requests whose path starts with `prefix`.
    pub fn path_prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self::from_fn(format!("path starts with {}", prefix), move |parts| {
            parts.uri.path().starts_with(&prefix)
        })
    }

    /// Matches requests carrying the header, whatever its value.
    pub fn has_header(name: HeaderName) -> Self {
        Self::from_fn(format!("has header {}", name), move |parts| {
            parts.headers.contains_key(&name)
        })
    }

    /// Matches when every classifier in `all` matches. An empty list matches
    /// everything.
    pub fn all_of(all: Vec<Classifier>) -> Self {
        if all.is_empty() {
            return Self::always();
        }
        if all.len() == 1 {
            return all.into_iter().next().unwrap_or_else(Self::always);
        }

        let description = all
            .iter()
            .map(|c| c.description.as_str())
            .collect::<Vec<_>>()
            .join(" and ");
        Self::from_fn(description, move |parts| all.iter().all(|c| c.matches(parts)))
    }

    /// Evaluate the predicate.
    pub fn matches(&self, parts: &Parts) -> bool {
        (self.predicate)(parts)
    }

    /// Human-readable summary, used in logs.
    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Debug for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Classifier")
            .field("description", &self.description)
            .finish()
    }
}
