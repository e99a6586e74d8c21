//! Throwaway HTTP servers for client tests

use axum::Router;

/// Serve `router` on an ephemeral local port; returns its base URL
pub async fn spawn_http(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("test server failed");
    });
    format!("http://{}", addr)
}
