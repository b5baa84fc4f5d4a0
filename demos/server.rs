use std::error::Error;

use axum::{extract::Path, routing::get, Router};
use server_utils::{setup, Config, RequestId, Server};

async fn hello(request_id: RequestId) -> String {
    tracing::info!("saying hello");
    format!("hello ({request_id})\n")
}

async fn user(Path(id): Path<u64>) -> String {
    format!("user {id}\n")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = Config::from_env()?;
    let telemetry = setup::setup(&config)?;

    let routes = Router::new()
        .route("/hello", get(hello))
        .route("/users/:id", get(user));

    Server::initialize(config, routes)?
        .with_shutdown_hook("telemetry", telemetry.into_shutdown_hook())
        .run()
        .await?;

    Ok(())
}
