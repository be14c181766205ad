//! Five workers sharing two TCP connections to a local echo server

use async_trait::async_trait;
use connections_pool::{Connectable, ConnectionPool, PoolConfiguration};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

struct EchoConnection {
    peer: SocketAddr,
    stream: Mutex<TcpStream>,
}

impl EchoConnection {
    async fn round_trip(&self, message: &str) -> io::Result<String> {
        let mut stream = self.stream.lock().await;
        stream.write_all(message.as_bytes()).await?;

        let mut buf = vec![0u8; message.len()];
        stream.read_exact(&mut buf).await?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

#[async_trait]
impl Connectable for EchoConnection {
    async fn close(&self) {
        let _ = self.stream.lock().await.shutdown().await;
        info!(peer = %self.peer, "Connection closed");
    }
}

async fn spawn_echo_server() -> io::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        while let Ok((mut socket, peer)) = listener.accept().await {
            info!(%peer, "Server accepted connection");
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                info!(%peer, "Server connection ended");
            });
        }
    });

    Ok(addr)
}

async fn worker(name: String, pool: ConnectionPool<EchoConnection, io::Error>) {
    info!(worker = %name, "Started work");
    match pool.get_connection().await {
        Ok(conn) => {
            let message = format!("hello from {name}");
            let reply = conn.round_trip(&message).await;
            match reply {
                Ok(reply) => info!(worker = %name, connection_id = %conn.id(), %reply, "Echoed"),
                Err(err) => {
                    info!(worker = %name, error = %err, "Connection broken, removing it");
                    conn.remove().await;
                    return;
                }
            }
            // making some operations
            tokio::time::sleep(Duration::from_millis(300)).await;
            if let Err(err) = conn.release() {
                info!(worker = %name, error = %err, "Release failed");
            }
            info!(worker = %name, "Finished work");
        }
        Err(err) => info!(worker = %name, error = %err, "Could not obtain connection"),
    }
}

#[tokio::main]
async fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,connections_pool=debug")),
        )
        .init();

    let addr = spawn_echo_server().await?;

    let pool = ConnectionPool::new(
        move || async move {
            let stream = TcpStream::connect(addr).await?;
            info!(peer = %addr, "Connected to server");
            Ok::<_, io::Error>(EchoConnection {
                peer: addr,
                stream: Mutex::new(stream),
            })
        },
        PoolConfiguration::new().with_connection_limit(2),
    )
    .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;

    let workers: Vec<_> = (1..=5)
        .map(|n| tokio::spawn(worker(format!("worker_{n}"), pool.clone())))
        .collect();
    for handle in workers {
        handle.await?;
    }

    let status = pool.status();
    info!(total = status.total, free = status.free, "All workers done");

    pool.close().await;
    info!("Pool is closed");
    Ok(())
}
