//! UDP and TCP listeners feeding the query pipeline

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::handler::Generation;

/// Maximum DNS message size for UDP
const MAX_DNS_MESSAGE_SIZE: usize = 4096;

/// Idle TCP connections are closed after this long
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound sockets and the tasks serving them
pub struct Listeners {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    local_addrs: Vec<SocketAddr>,
}

impl Listeners {
    /// Bind every configured address, then start serving
    ///
    /// Nothing is served unless every address binds.
    pub async fn bind(
        udp_addrs: &[SocketAddr],
        tcp_addrs: &[SocketAddr],
        generation: Arc<Generation>,
    ) -> Result<Self> {
        let mut udp_sockets = Vec::with_capacity(udp_addrs.len());
        for &addr in udp_addrs {
            let socket = UdpSocket::bind(addr)
                .await
                .map_err(|source| Error::Bind { addr, source })?;
            udp_sockets.push(socket);
        }

        let mut tcp_listeners = Vec::with_capacity(tcp_addrs.len());
        for &addr in tcp_addrs {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|source| Error::Bind { addr, source })?;
            tcp_listeners.push(listener);
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut tasks = Vec::with_capacity(udp_sockets.len() + tcp_listeners.len());
        let mut local_addrs = Vec::with_capacity(tasks.capacity());

        for socket in udp_sockets {
            let addr = socket.local_addr()?;
            log::info!("DNS listening on udp://{}", addr);
            local_addrs.push(addr);
            tasks.push(tokio::spawn(serve_udp(
                socket,
                generation.clone(),
                shutdown_tx.subscribe(),
            )));
        }

        for listener in tcp_listeners {
            let addr = listener.local_addr()?;
            log::info!("DNS listening on tcp://{}", addr);
            local_addrs.push(addr);
            // Subscribed before spawning so a shutdown sent right away is not missed
            tasks.push(tokio::spawn(serve_tcp(
                listener,
                generation.clone(),
                shutdown_tx.clone(),
                shutdown_tx.subscribe(),
            )));
        }

        Ok(Self {
            shutdown_tx,
            tasks,
            local_addrs,
        })
    }

    /// Addresses actually bound, UDP first
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Signal every loop and wait for them to release their sockets
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for task in self.tasks {
            if let Err(e) = task.await {
                log::warn!("DNS listener task failed: {}", e);
            }
        }
    }
}

async fn serve_udp(socket: UdpSocket, generation: Arc<Generation>, mut shutdown_rx: broadcast::Receiver<()>) {
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; MAX_DNS_MESSAGE_SIZE];

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                log::debug!("UDP listener shutting down");
                break;
            }

            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src)) => {
                        let query = buf[..len].to_vec();
                        let socket = socket.clone();
                        let generation = generation.clone();

                        tokio::spawn(async move {
                            if let Some(response) = generation.handle_query(&query, src.ip()).await {
                                if let Err(e) = socket.send_to(&response, src).await {
                                    log::debug!("Failed to send DNS response to {}: {}", src, e);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        log::error!("DNS recv error: {}", e);
                    }
                }
            }
        }
    }
}

async fn serve_tcp(
    listener: TcpListener,
    generation: Arc<Generation>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                log::debug!("TCP listener shutting down");
                break;
            }

            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let generation = generation.clone();
                        let conn_shutdown = shutdown_tx.subscribe();
                        tokio::spawn(async move {
                            if let Err(e) = serve_tcp_conn(stream, peer, generation, conn_shutdown).await {
                                log::debug!("DNS TCP connection from {} ended: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        log::error!("DNS accept error: {}", e);
                    }
                }
            }
        }
    }
}

/// Length-prefixed queries until the peer closes, idles or we shut down
async fn serve_tcp_conn(
    mut stream: TcpStream,
    peer: SocketAddr,
    generation: Arc<Generation>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    loop {
        let len = tokio::select! {
            _ = shutdown_rx.recv() => return Ok(()),
            read = tokio::time::timeout(TCP_IDLE_TIMEOUT, stream.read_u16()) => match read {
                Ok(Ok(len)) => len as usize,
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Ok(Err(e)) => return Err(e),
                Err(_) => return Ok(()),
            },
        };

        let mut query = vec![0u8; len];
        stream.read_exact(&mut query).await?;

        let Some(response) = generation.handle_query(&query, peer.ip()).await else {
            return Ok(());
        };

        let len = u16::try_from(response.len())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "DNS response too large"))?;
        stream.write_u16(len).await?;
        stream.write_all(&response).await?;
    }
}
