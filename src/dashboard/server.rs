use std::net::SocketAddr;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::routes::{self, ControlState};

/// Bind the control API on all interfaces.
pub async fn bind(port: u16) -> anyhow::Result<TcpListener> {
    let addr = format!("0.0.0.0:{}", port);
    TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding control API on {addr}"))
}

/// Serve until `cancel` fires.
pub async fn serve_control_api(
    listener: TcpListener,
    state: ControlState,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let app = routes::control_router(state);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(cancel.cancelled_owned())
    .await?;

    Ok(())
}
