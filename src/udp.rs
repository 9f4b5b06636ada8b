// UDP listener for raw timing records
//
// Decoder gateways and foreign timers deliver one or more
// INDEX;SOURCE;CHANNEL;REFID;TOD lines per datagram. Each line is
// stamped with host receive time and forwarded to the coordinator.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::clock::{Clock, SystemClock};
use crate::coordinator::Event;
use crate::intake::parse_timer_line;

pub struct UdpServer {
    socket: Arc<UdpSocket>,
    shutdown_tx: mpsc::Sender<()>,
}

impl UdpServer {
    /// Bind to address and start listening.
    pub async fn start(addr: SocketAddr, events: mpsc::Sender<Event>) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        let server = UdpServer {
            socket: socket.clone(),
            shutdown_tx,
        };

        tokio::spawn(async move {
            let clock = SystemClock;
            let mut buf = [0u8; 2048];
            loop {
                tokio::select! {
                    res = socket.recv_from(&mut buf) => {
                        match res {
                            Ok((size, peer)) => {
                                Self::process_datagram(
                                    &buf[..size], peer, &events, &clock,
                                ).await;
                            }
                            Err(e) => {
                                error!("UDP receive error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("UDP server shutting down");
                        break;
                    }
                }
            }
        });

        info!("UDP listener on {}", addr);
        Ok(server)
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }

    pub fn addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    async fn process_datagram(
        data: &[u8],
        peer: SocketAddr,
        events: &mpsc::Sender<Event>,
        clock: &dyn Clock,
    ) {
        let text = match std::str::from_utf8(data) {
            Ok(t) => t,
            Err(_) => {
                debug!("Non-text datagram from {}", peer);
                return;
            }
        };
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_timer_line(line, clock) {
                Ok(rec) => {
                    if events.send(Event::Raw(rec)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!("Dropped record from {}: {}", peer, e);
                }
            }
        }
    }
}
