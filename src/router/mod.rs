//! Request routing: map route templates and HTTP methods to handlers.
//!
//! This module provides [`Router`], an ordered table of
//! `(method, compiled pattern, handler)` entries built once at startup and
//! read-only afterwards. Templates use typed placeholders, compiled by
//! [`pattern::CompiledPattern`]:
//!
//! | Template                        | Example match          | Captured params            |
//! |---------------------------------|------------------------|----------------------------|
//! | `/users/`                       | `/users/`              | *(none)*                   |
//! | `/users/<id:int>/`              | `/users/42/`           | `id → 42`                  |
//! | `/tags/<names:list>`            | `/tags/a,b`            | `names → ["a", "b"]`       |
//! | `/filter/<f:dict>`              | `/filter/a=1,b=2`      | `f → {"a": "1", "b": "2"}` |
//!
//! Paths are matched strictly: `/users/` and `/users` are different routes.
//!
//! Resolution walks the entries in registration order. The first entry whose
//! pattern and method both match wins. If the path fits one or more entries
//! but none for the requested method, the router answers `OPTIONS` itself
//! (204 with an `Allow` header) and rejects every other method with 405.

pub mod pattern;
pub mod value;

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::context::{Params, RequestContext};
use crate::dispatch::Reply;
use crate::error::{Error, HttpError};
use crate::http::{Method, StatusCode};
use crate::validate::ParamsValidator;

use self::pattern::{CompiledPattern, RouteError};

/// Type-erased, heap-allocated async handler.
///
/// Handlers are stored behind `Arc<dyn Fn(…)>` so they can be shared across
/// tasks without copying the underlying closure. You rarely build one by hand;
/// [`Router::get`], [`Endpoint::post`] and friends erase the closure for you.
pub type Handler =
    Arc<dyn Fn(RequestContext) -> BoxFuture<'static, Result<Reply, Error>> + Send + Sync + 'static>;

/// Erases an async handler function into a [`Handler`].
pub fn handler<H, F>(f: H) -> Handler
where
    H: Fn(RequestContext) -> F + Send + Sync + 'static,
    F: Future<Output = Result<Reply, Error>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// A declared endpoint: method, route template, handler and an optional
/// validator for the query string.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use tandem::dispatch::Reply;
/// use tandem::router::{Endpoint, Router};
/// use tandem::router::value::ParamType;
/// use tandem::validate::ParamsValidator;
///
/// let endpoint = Endpoint::get("/items/", |ctx| async move {
///     let page: i64 = ctx.query_params().get("page")?;
///     Ok(Reply::json(json!({ "page": page })))
/// })
/// .with_query(ParamsValidator::new().field("page", ParamType::Int, "page must be a number"));
///
/// let mut router = Router::new();
/// router.add(endpoint).unwrap();
/// assert_eq!(router.len(), 1);
/// ```
pub struct Endpoint {
    method: Method,
    template: String,
    handler: Handler,
    query: Option<ParamsValidator>,
}

impl Endpoint {
    pub fn new<H, F>(method: Method, template: impl Into<String>, f: H) -> Self
    where
        H: Fn(RequestContext) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Reply, Error>> + Send + 'static,
    {
        Self {
            method,
            template: template.into(),
            handler: handler(f),
            query: None,
        }
    }

    pub fn get<H, F>(template: impl Into<String>, f: H) -> Self
    where
        H: Fn(RequestContext) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Reply, Error>> + Send + 'static,
    {
        Self::new(Method::Get, template, f)
    }

    pub fn post<H, F>(template: impl Into<String>, f: H) -> Self
    where
        H: Fn(RequestContext) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Reply, Error>> + Send + 'static,
    {
        Self::new(Method::Post, template, f)
    }

    pub fn put<H, F>(template: impl Into<String>, f: H) -> Self
    where
        H: Fn(RequestContext) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Reply, Error>> + Send + 'static,
    {
        Self::new(Method::Put, template, f)
    }

    pub fn patch<H, F>(template: impl Into<String>, f: H) -> Self
    where
        H: Fn(RequestContext) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Reply, Error>> + Send + 'static,
    {
        Self::new(Method::Patch, template, f)
    }

    pub fn delete<H, F>(template: impl Into<String>, f: H) -> Self
    where
        H: Fn(RequestContext) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Reply, Error>> + Send + 'static,
    {
        Self::new(Method::Delete, template, f)
    }

    /// Coerce the query string with `validator` before the handler runs.
    #[must_use]
    pub fn with_query(mut self, validator: ParamsValidator) -> Self {
        self.query = Some(validator);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn template(&self) -> &str {
        &self.template
    }
}

/// A group of endpoints mounted under a common URL prefix.
///
/// Implementors usually hold their collaborators behind an `Arc` and clone it
/// into each endpoint closure.
pub trait Controller {
    /// Prefix joined in front of every endpoint template. A trailing `/` is
    /// ignored.
    fn prefix(&self) -> &str {
        ""
    }

    fn endpoints(&self) -> Vec<Endpoint>;
}

// A registered route: method + compiled pattern + handler.
struct Route {
    method: Method,
    pattern: CompiledPattern,
    handler: Handler,
    query: Option<ParamsValidator>,
}

/// The outcome of a successful [`Router::resolve`].
pub struct RouteMatch<'a> {
    pub handler: Handler,
    pub params: Params,
    template: &'a str,
    query: Option<&'a ParamsValidator>,
}

impl RouteMatch<'_> {
    /// Template of the route that matched.
    pub fn template(&self) -> &str {
        self.template
    }

    pub fn query_validator(&self) -> Option<&ParamsValidator> {
        self.query
    }
}

/// Ordered route table.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use tandem::dispatch::Reply;
/// use tandem::http::Method;
/// use tandem::router::Router;
///
/// let mut router = Router::new();
/// router
///     .get("/hello/<name:str>/", |ctx| async move {
///         let name: String = ctx.param("name")?;
///         Ok(Reply::json(json!({ "hello": name })))
///     })
///     .unwrap();
///
/// let matched = router.resolve(&Method::Get, "/hello/ana/").unwrap().unwrap();
/// assert_eq!(matched.params.get::<String>("name").unwrap(), "ana");
/// assert!(router.resolve(&Method::Get, "/bye/").unwrap().is_none());
/// ```
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `endpoint`, compiling its template.
    ///
    /// # Errors
    ///
    /// Returns a [`RouteError`] when the template uses an unknown placeholder
    /// type or declares a name twice. Treat it as fatal: the application
    /// should not start with a broken route table.
    pub fn add(&mut self, endpoint: Endpoint) -> Result<&mut Self, RouteError> {
        let pattern = CompiledPattern::compile(&endpoint.template)?;
        self.routes.push(Route {
            method: endpoint.method,
            pattern,
            handler: endpoint.handler,
            query: endpoint.query,
        });
        Ok(self)
    }

    /// Registers every endpoint of `controller` under its prefix.
    ///
    /// # Errors
    ///
    /// Fails on the first endpoint whose template does not compile.
    pub fn controller(&mut self, controller: &impl Controller) -> Result<&mut Self, RouteError> {
        let prefix = controller.prefix().trim_end_matches('/');
        for mut endpoint in controller.endpoints() {
            endpoint.template = format!("{prefix}{}", endpoint.template);
            self.add(endpoint)?;
        }
        Ok(self)
    }

    pub fn get<H, F>(&mut self, template: &str, f: H) -> Result<&mut Self, RouteError>
    where
        H: Fn(RequestContext) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Reply, Error>> + Send + 'static,
    {
        self.add(Endpoint::new(Method::Get, template, f))
    }

    pub fn post<H, F>(&mut self, template: &str, f: H) -> Result<&mut Self, RouteError>
    where
        H: Fn(RequestContext) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Reply, Error>> + Send + 'static,
    {
        self.add(Endpoint::new(Method::Post, template, f))
    }

    pub fn put<H, F>(&mut self, template: &str, f: H) -> Result<&mut Self, RouteError>
    where
        H: Fn(RequestContext) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Reply, Error>> + Send + 'static,
    {
        self.add(Endpoint::new(Method::Put, template, f))
    }

    pub fn patch<H, F>(&mut self, template: &str, f: H) -> Result<&mut Self, RouteError>
    where
        H: Fn(RequestContext) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Reply, Error>> + Send + 'static,
    {
        self.add(Endpoint::new(Method::Patch, template, f))
    }

    pub fn delete<H, F>(&mut self, template: &str, f: H) -> Result<&mut Self, RouteError>
    where
        H: Fn(RequestContext) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Reply, Error>> + Send + 'static,
    {
        self.add(Endpoint::new(Method::Delete, template, f))
    }

    /// Registers an explicit `OPTIONS` handler, which takes precedence over
    /// the automatic `Allow` response for the paths it matches.
    pub fn options<H, F>(&mut self, template: &str, f: H) -> Result<&mut Self, RouteError>
    where
        H: Fn(RequestContext) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Reply, Error>> + Send + 'static,
    {
        self.add(Endpoint::new(Method::Options, template, f))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Resolves `(method, path)` to a handler and its converted path
    /// parameters.
    ///
    /// Returns `Ok(None)` when no route matches the path at all. Conversion
    /// only runs for the route that is selected.
    ///
    /// # Errors
    ///
    /// - 405 when the path matches but no entry accepts `method`.
    /// - 422 when a captured segment fails conversion (for example a
    ///   malformed `dict` token).
    pub fn resolve(&self, method: &Method, path: &str) -> Result<Option<RouteMatch<'_>>, HttpError> {
        let mut allowed = BTreeSet::new();
        let mut first: Option<&Route> = None;

        for route in &self.routes {
            if !route.pattern.is_match(path) {
                continue;
            }
            if route.method == *method {
                let params = route.pattern.matches(path)?.unwrap_or_default();
                return Ok(Some(RouteMatch {
                    handler: Arc::clone(&route.handler),
                    params,
                    template: route.pattern.template(),
                    query: route.query.as_ref(),
                }));
            }
            allowed.insert(route.method.as_str().to_owned());
            first.get_or_insert(route);
        }

        let Some(first) = first else {
            return Ok(None);
        };

        if *method == Method::Options {
            allowed.insert(Method::Options.as_str().to_owned());
            let allow = allowed.into_iter().collect::<Vec<_>>().join(", ");
            return Ok(Some(RouteMatch {
                handler: allow_handler(allow),
                params: Params::new(),
                template: first.pattern.template(),
                query: None,
            }));
        }

        Err(HttpError::method_not_allowed())
    }
}

// The synthetic OPTIONS response listing the methods a path accepts.
fn allow_handler(allow: String) -> Handler {
    Arc::new(move |_ctx| {
        let reply = Reply::new(StatusCode::NoContent)
            .header("Allow", allow.clone())
            .header("Content-Length", "0");
        Box::pin(async move { Ok(reply) })
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::context::{BodyReader, Scope};
    use crate::dispatch::NormalizedResponse;
    use crate::transport::ProtocolKind;

    async fn ok(_ctx: RequestContext) -> Result<Reply, Error> {
        Ok(Reply::json(json!("ok")))
    }

    async fn call(matched: RouteMatch<'_>, method: Method, path: &str) -> NormalizedResponse {
        let scope = Scope::new(ProtocolKind::SingleShot, method, path);
        let ctx = RequestContext::new(
            scope,
            matched.params,
            Default::default(),
            Params::new(),
            BodyReader::empty(),
        );
        (matched.handler)(ctx).await.unwrap().into()
    }

    fn get_and_post() -> Router {
        let mut router = Router::new();
        router.get("/users/<id:int>/", ok).unwrap();
        router.post("/users/<id:int>/", ok).unwrap();
        router
    }

    #[test]
    fn starts_empty() {
        let router = Router::default();
        assert!(router.is_empty());
        assert_eq!(router.len(), 0);
    }

    #[test]
    fn invalid_template_is_rejected_at_registration() {
        let mut router = Router::new();
        assert!(router.get("/x/<id:uuid>/", ok).is_err());
        assert!(router.is_empty());
    }

    #[test]
    fn unmatched_path_is_none() {
        let router = get_and_post();
        assert!(router.resolve(&Method::Get, "/posts/1/").unwrap().is_none());
        assert!(router.resolve(&Method::Get, "/users/abc/").unwrap().is_none());
        assert!(router.resolve(&Method::Get, "/users/1").unwrap().is_none());
    }

    #[test]
    fn first_registered_route_wins() {
        let mut router = Router::new();
        router.get("/a/<x:str>/", ok).unwrap();
        router.get("/a/<y:int>/", ok).unwrap();
        let matched = router.resolve(&Method::Get, "/a/5/").unwrap().unwrap();
        assert_eq!(matched.template(), "/a/<x:str>/");
        assert_eq!(matched.params.get::<String>("x").unwrap(), "5");
    }

    #[test]
    fn wrong_method_is_405_not_404() {
        let err = get_and_post()
            .resolve(&Method::Delete, "/users/1/")
            .err()
            .unwrap();
        assert_eq!(err.status(), StatusCode::MethodNotAllowed);
    }

    #[tokio::test]
    async fn options_lists_allowed_methods() {
        let router = get_and_post();
        let matched = router.resolve(&Method::Options, "/users/1/").unwrap().unwrap();
        assert!(matched.params.is_empty());

        let res = call(matched, Method::Options, "/users/1/").await;
        assert_eq!(res.status(), StatusCode::NoContent);
        assert_eq!(res.headers().get("Allow"), Some("GET, OPTIONS, POST"));
        assert_eq!(res.headers().get("Content-Length"), Some("0"));
        assert!(res.body().is_null());
    }

    #[tokio::test]
    async fn explicit_options_handler_takes_precedence() {
        let mut router = get_and_post();
        router
            .options("/users/<id:int>/", |_ctx| async {
                Ok(Reply::new(StatusCode::Ok).header("X-Custom", "1"))
            })
            .unwrap();
        let matched = router.resolve(&Method::Options, "/users/1/").unwrap().unwrap();
        let res = call(matched, Method::Options, "/users/1/").await;
        assert_eq!(res.status(), StatusCode::Ok);
        assert_eq!(res.headers().get("X-Custom"), Some("1"));
    }

    #[test]
    fn conversion_failure_is_422() {
        let mut router = Router::new();
        router.get("/f/<d:dict>", ok).unwrap();
        let err = router.resolve(&Method::Get, "/f/a=1,b").err().unwrap();
        assert_eq!(err.status(), StatusCode::UnprocessableEntity);
    }

    #[test]
    fn resolving_twice_yields_the_same_params() {
        let router = get_and_post();
        let a = router.resolve(&Method::Get, "/users/7/").unwrap().unwrap();
        let b = router.resolve(&Method::Get, "/users/7/").unwrap().unwrap();
        assert_eq!(a.params, b.params);
    }

    struct Accounts;

    impl Controller for Accounts {
        fn prefix(&self) -> &str {
            "/accounts/"
        }

        fn endpoints(&self) -> Vec<Endpoint> {
            vec![
                Endpoint::get("/<id:int>/", ok),
                Endpoint::delete("/<id:int>/", ok),
            ]
        }
    }

    #[test]
    fn controller_endpoints_are_prefixed() {
        let mut router = Router::new();
        router.controller(&Accounts).unwrap();
        assert_eq!(router.len(), 2);
        let matched = router.resolve(&Method::Delete, "/accounts/3/").unwrap().unwrap();
        assert_eq!(matched.template(), "/accounts/<id:int>/");
        assert!(router.resolve(&Method::Get, "/accounts//3/").unwrap().is_none());
    }
}
