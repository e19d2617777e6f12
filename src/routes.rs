use std::sync::Arc;

use matchit::Router;

use crate::error::RouteError;
use crate::handler::{Handler, HandlerType};

/// Static table from URL path to handler type, built once before serving.
///
/// Paths follow `matchit` syntax: `/hello/:name` captures one segment and
/// `/static/*file` captures the rest.
pub struct Routes {
    router: Router<usize>,
    types: Vec<(String, Arc<HandlerType>)>,
}

impl Default for Routes {
    fn default() -> Self {
        Self::new()
    }
}

/// A matched route.
#[derive(Debug)]
pub struct Resolved<'r> {
    /// The pattern the route was registered under, e.g. `/hello/:name`.
    pub pattern: &'r str,
    pub handler_type: Arc<HandlerType>,
    /// Captured path parameters, in pattern order.
    pub params: Vec<(String, String)>,
}

impl Routes {
    pub fn new() -> Self {
        Routes {
            router: Router::new(),
            types: Vec::new(),
        }
    }

    /// Routes `path` to `H`, built with `H::default()` and the default policy.
    pub fn route<H: Handler + Default>(self, path: &str) -> Result<Self, RouteError> {
        self.insert(path, HandlerType::of::<H>())
    }

    /// Routes `path` to a fully configured handler type.
    pub fn insert(self, path: &str, handler_type: HandlerType) -> Result<Self, RouteError> {
        self.insert_shared(path, Arc::new(handler_type))
    }

    /// Routes `path` to a handler type that may already serve other paths;
    /// its pool is shared between them.
    pub fn insert_shared(mut self, path: &str, handler_type: Arc<HandlerType>) -> Result<Self, RouteError> {
        self.router
            .insert(path, self.types.len())
            .map_err(|e| RouteError::Insert {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        self.types.push((path.to_string(), handler_type));
        Ok(self)
    }

    pub fn resolve(&self, path: &str) -> Result<Resolved<'_>, RouteError> {
        let unmapped = || RouteError::Unmapped(path.to_string());
        let matched = self.router.at(path).map_err(|_| unmapped())?;
        let (pattern, handler_type) = self.types.get(*matched.value).ok_or_else(unmapped)?;
        let params = matched
            .params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Ok(Resolved {
            pattern,
            handler_type: handler_type.clone(),
            params,
        })
    }

    /// Every registered `(path, type)` pair, in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Arc<HandlerType>)> {
        self.types.iter().map(|(path, t)| (path.as_str(), t))
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
