use relay::{RelayError, RelayState, WEBSOCKET_PATH, app};

#[tokio::main]
async fn main() -> Result<(), RelayError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let port: u16 = std::env::var("PORT").unwrap_or_else(|_| "8080".into()).parse()?;
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    tracing::info!(port, path = WEBSOCKET_PATH, "relay listening");

    axum::serve(listener, app(RelayState::new())).await?;
    Ok(())
}
