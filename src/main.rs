use actix_web::{web, App, HttpServer};
use clap::Parser;

use falgate::config::Config;
use falgate::server::config_routes;
use falgate::util::{cors_config_from_env, error_response, init_tracing, AppState};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before clap so env-backed flags see it.
    init_tracing();
    let config = Config::parse();

    let state = web::Data::new(AppState::from_config(&config)?);
    tracing::info!(
        bind = %config.bind_addr,
        credentials = state.engine.pool().len(),
        strategy = state.engine.assembler().name(),
        char_limit = config.prompt_char_limit,
        auth_required = state.authorization_token.is_some(),
        "starting falgate"
    );

    HttpServer::new(move || {
        let json_cfg = web::JsonConfig::default()
            .limit(16 * 1024 * 1024)
            .error_handler(|err, _req| {
                let resp = error_response(http::StatusCode::BAD_REQUEST, &err.to_string());
                actix_web::error::InternalError::from_response(err, resp).into()
            });
        App::new()
            .wrap(cors_config_from_env())
            .app_data(state.clone())
            .app_data(json_cfg)
            .configure(config_routes)
    })
    .bind(&config.bind_addr)?
    .run()
    .await?;

    Ok(())
}
