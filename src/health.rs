use tokio::{io::AsyncWriteExt, net::TcpListener, task::JoinHandle};

/// Bind the health check port on localhost.
pub async fn bind_healthcheck_listener(port: u16) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|err| anyhow::anyhow!("fail to bind health check listener on {port}: {err}"))?;
    tracing::info!("Health check listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Answer `OK` to every connection in a non-blocking task, for container HEALTHCHECK probes.
pub fn spawn_healthcheck_listener(listener: TcpListener) -> JoinHandle<()> {
    tokio::task::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tracing::debug!("New Stream Incoming");
            let res = stream.write_all(b"OK").await;
            if let Err(err) = res {
                tracing::error!("fail to response to health checker: {err}")
            }
        }
    })
}

#[tokio::test]
async fn test_healthcheck() {
    use tokio::io::AsyncReadExt;

    let listener = bind_healthcheck_listener(0).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = spawn_healthcheck_listener(listener);

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let mut reply = String::new();
    stream.read_to_string(&mut reply).await.unwrap();
    assert_eq!("OK", reply);

    handle.abort();
}
