use std::net::{IpAddr, SocketAddr};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Lifecycle holder for the GameSpy-style UDP query endpoint.
///
/// Only the bind/close lifecycle lives in the core; the response protocol is
/// an external concern. Datagrams are drained so the socket buffer cannot
/// fill while the feature is enabled.
pub struct QueryListener {
    token: CancellationToken,
    pub local_addr: SocketAddr,
}

impl QueryListener {
    pub async fn bind(host: IpAddr, port: u16, parent: &CancellationToken) -> std::io::Result<Self> {
        let socket = UdpSocket::bind((host, port)).await?;
        let local_addr = socket.local_addr()?;
        let token = parent.child_token();
        info!("query endpoint listening on {local_addr}");

        let task_token = token.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((len, peer)) => debug!("query datagram from {peer}: {len} bytes"),
                        Err(err) => {
                            debug!("query socket error: {err}");
                            break;
                        }
                    },
                }
            }
            debug!("query endpoint closed");
        });

        Ok(Self { token, local_addr })
    }

    pub fn close(&self) {
        self.token.cancel();
    }
}

impl Drop for QueryListener {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_and_close_lifecycle() {
        let parent = CancellationToken::new();
        let listener = QueryListener::bind("127.0.0.1".parse().unwrap(), 0, &parent)
            .await
            .unwrap();
        assert_ne!(listener.local_addr.port(), 0);
        listener.close();
    }
}
