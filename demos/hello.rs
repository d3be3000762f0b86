//! Minimal tandem application.
//!
//! ```text
//! RUST_LOG=debug cargo run --example hello
//! curl http://127.0.0.1:8080/teste/5/teste/9/
//! curl -X OPTIONS -i http://127.0.0.1:8080/hello/ana/
//! curl -H 'Authorization: Bearer valid-token' http://127.0.0.1:8080/me/
//! ```

use std::sync::Arc;

use serde_json::json;
use tandem::config::Settings;
use tandem::context::{Identity, RequestContext};
use tandem::dispatch::{App, Reply};
use tandem::middleware::{ChainBuilder, HandleError, RequestLogging};
use tandem::router::value::ParamType;
use tandem::router::{Controller, Endpoint, Router};
use tandem::security::{Authentication, Cors, StaticTokens};
use tandem::server::Server;
use tandem::validate::ParamsValidator;
use tracing_subscriber::EnvFilter;

struct Teste;

impl Controller for Teste {
    fn endpoints(&self) -> Vec<Endpoint> {
        vec![
            Endpoint::get("/teste/<id:int>/", |ctx: RequestContext| async move {
                Ok(Reply::json(json!({ "id": ctx.param::<i64>("id")? })))
            }),
            Endpoint::get("/teste/<id_1:int>/teste/<id_2:int>/", |ctx: RequestContext| async move {
                Ok(Reply::json(json!({
                    "arg1": ctx.param::<i64>("id_1")?,
                    "arg2": ctx.param::<i64>("id_2")?,
                })))
            }),
            Endpoint::get("/hello/<name:str>/", |ctx: RequestContext| async move {
                Ok(Reply::json(json!({ "name": ctx.param::<String>("name")? })))
            }),
            Endpoint::post("/test/login/<token:str>/", |ctx: RequestContext| async move {
                let body = ctx
                    .body_validated(&ParamsValidator::new().field("user_id", ParamType::Int, "user_id requerido"))
                    .await?;
                Ok(Reply::json(json!({
                    "token": ctx.param::<String>("token")?,
                    "user_id": body.get::<i64>("user_id")?,
                    "query": ctx.query(),
                })))
            }),
            Endpoint::get("/me/", |ctx: RequestContext| async move {
                let user = ctx.require_user()?;
                Ok(Reply::json(json!({ "user": user.id })))
            }),
        ]
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mode = std::env::var("TANDEM_MODE").unwrap_or_else(|_| "dev".to_owned());
    let settings = Arc::new(Settings::load(".", &mode)?.apply_env()?);

    let mut router = Router::new();
    router.controller(&Teste)?;

    let tokens = StaticTokens::new().with_token("valid-token", Identity::new("John Doe"));
    let chain = ChainBuilder::new(App::new(router, settings.clone()))
        .add_middleware(Authentication::from_settings(tokens, &settings))
        .add_middleware(HandleError)
        .add_middleware(Cors::from_settings(&settings))
        .add_middleware(RequestLogging)
        .build();

    Server::bind(&settings.bind_addr).await?.serve(chain).await?;
    Ok(())
}
