//! Connection supervisor: owns the analyzer-side TCP link in client or
//! server mode, runs the receive loop per connection, reconnects with
//! exponential backoff and tears everything down on `stop_listening`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::{AnalyzerConfig, ConnectionMode};
use crate::protocol::astm::{AstmLink, IdleEvent};
use crate::protocol::error::ProtocolError;
use crate::services::coordinator::{OrderLink, TransactionCoordinator};

const INITIAL_BACKOFF_MS: u64 = 5_000;
const MAX_BACKOFF_MS: u64 = 60_000;

/// Worst-case LAB-28 delivery: establishment plus six attempts for each of
/// the four worklist frames.
const ORDER_COMPLETION_TIMEOUT_SECS: u64 = 300;

/// One LAB-28 download queued for the active connection loop.
struct OrderRequest {
    records: Vec<String>,
    done: oneshot::Sender<Result<(), String>>,
}

/// Handle used to inject an order into the half-duplex connection loop;
/// the loop picks it up while the link is idle.
#[derive(Clone)]
pub struct OrderSender {
    tx: mpsc::Sender<OrderRequest>,
}

#[async_trait]
impl OrderLink for OrderSender {
    async fn send_order(&self, records: Vec<String>) -> Result<(), String> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(OrderRequest {
                records,
                done: done_tx,
            })
            .await
            .map_err(|_| "analyzer link is down".to_string())?;

        match timeout(Duration::from_secs(ORDER_COMPLETION_TIMEOUT_SECS), done_rx).await {
            Err(_) => Err("timed out waiting for an analyzer connection".to_string()),
            Ok(Err(_)) => Err("analyzer connection dropped while sending".to_string()),
            Ok(Ok(result)) => result,
        }
    }
}

pub struct ConnectionSupervisor {
    config: AnalyzerConfig,
    coordinator: Arc<TransactionCoordinator>,
    listening: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    order_tx: mpsc::Sender<OrderRequest>,
    order_rx: Arc<Mutex<mpsc::Receiver<OrderRequest>>>,
    bound_addr: StdMutex<Option<SocketAddr>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    pub fn new(coordinator: Arc<TransactionCoordinator>) -> Self {
        let (order_tx, order_rx) = mpsc::channel(4);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config: coordinator.config().clone(),
            coordinator,
            listening: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            order_tx,
            order_rx: Arc::new(Mutex::new(order_rx)),
            bound_addr: StdMutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Start the analyzer-side link. Server mode binds and accepts one
    /// connection at a time; client mode dials out and reconnects with
    /// exponential backoff. Unsupported `type_cnx` values never get here:
    /// configuration parsing already refuses them.
    pub async fn listen_device(&self) -> anyhow::Result<()> {
        if self.listening.swap(true, Ordering::SeqCst) {
            anyhow::bail!("already listening");
        }
        self.shutdown_tx.send_replace(false);

        let addr = self.config.analyzer_addr();
        log::info!(
            "Starting analyzer link for {} ({:?}, {} mode, {})",
            self.config.id_analyzer,
            self.config.type_cnx,
            self.config.mode,
            addr
        );

        let coordinator = self.coordinator.clone();
        let listening = self.listening.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        let order_rx = self.order_rx.clone();

        let handle = match self.config.mode {
            ConnectionMode::Server => {
                let listener = match TcpListener::bind(&addr).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        self.listening.store(false, Ordering::SeqCst);
                        return Err(anyhow::anyhow!("failed to bind to {}: {}", addr, e));
                    }
                };
                *self.bound_addr.lock().unwrap() = listener.local_addr().ok();
                log::info!("Listening for the analyzer on {}", addr);

                tokio::spawn(Self::server_loop(
                    listener,
                    coordinator,
                    listening,
                    shutdown_rx,
                    order_rx,
                ))
            }
            ConnectionMode::Client => tokio::spawn(Self::client_loop(
                addr,
                coordinator,
                listening,
                shutdown_rx,
                order_rx,
            )),
        };

        *self.task.lock().await = Some(handle);
        Ok(())
    }

    /// Stop the link and release the listening socket. Idempotent; returns
    /// once the connection loop has fully exited, so a subsequent
    /// `listen_device` can rebind the same port. A connection blocked on a
    /// read, even mid-frame, is cancelled and its socket closed.
    pub async fn stop_listening(&self) {
        self.listening.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                log::warn!("Connection loop ended abnormally: {}", e);
            }
        }
        *self.bound_addr.lock().unwrap() = None;
        log::info!("Analyzer link for {} stopped", self.config.id_analyzer);
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Address actually bound in server mode (useful with port 0).
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock().unwrap()
    }

    /// Handle for LAB-28 order downloads.
    pub fn order_sender(&self) -> OrderSender {
        OrderSender {
            tx: self.order_tx.clone(),
        }
    }

    pub fn info(&self) -> serde_json::Value {
        serde_json::json!({
            "id_analyzer": self.config.id_analyzer,
            "version": self.config.version,
            "mode": self.config.mode.to_string(),
            "operation_mode": self.config.operation_mode,
            "analyzer_addr": self.config.analyzer_addr(),
            "listening": self.is_listening(),
        })
    }

    async fn server_loop(
        listener: TcpListener,
        coordinator: Arc<TransactionCoordinator>,
        listening: Arc<AtomicBool>,
        mut shutdown_rx: watch::Receiver<bool>,
        order_rx: Arc<Mutex<mpsc::Receiver<OrderRequest>>>,
    ) {
        while listening.load(Ordering::SeqCst) {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        log::info!("Analyzer connected from {}", peer);
                        Self::run_connection(
                            stream,
                            &coordinator,
                            &listening,
                            &mut shutdown_rx,
                            &order_rx,
                        )
                        .await;
                        log::info!("Connection from {} ended", peer);
                    }
                    Err(e) => {
                        log::error!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
        // Dropping the listener here releases the port before
        // stop_listening returns.
        drop(listener);
        log::info!("Listener socket released");
    }

    async fn client_loop(
        addr: String,
        coordinator: Arc<TransactionCoordinator>,
        listening: Arc<AtomicBool>,
        mut shutdown_rx: watch::Receiver<bool>,
        order_rx: Arc<Mutex<mpsc::Receiver<OrderRequest>>>,
    ) {
        let mut backoff_ms = INITIAL_BACKOFF_MS;
        while listening.load(Ordering::SeqCst) {
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    log::info!("Connected to analyzer at {}", addr);
                    backoff_ms = INITIAL_BACKOFF_MS;
                    Self::run_connection(
                        stream,
                        &coordinator,
                        &listening,
                        &mut shutdown_rx,
                        &order_rx,
                    )
                    .await;
                    log::info!("Connection to {} ended", addr);
                }
                Err(e) => {
                    log::warn!("Cannot reach analyzer at {}: {}", addr, e);
                }
            }

            if !listening.load(Ordering::SeqCst) {
                break;
            }
            log::debug!("Reconnecting in {} ms", backoff_ms);
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
            }
            backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
        }
    }

    /// Per-connection loop. The link is half-duplex: it idles waiting for
    /// an analyzer ENQ, and between messages picks up queued LAB-28
    /// downloads. A reply produced for an inbound message is transmitted
    /// before the next idle wait.
    ///
    /// Every await on the link races the shutdown channel, including
    /// mid-frame reads with no deadline of their own: a stalled analyzer
    /// cannot hold `stop_listening` hostage. Breaking out drops the link
    /// and with it the socket, which is how in-flight I/O is unblocked.
    async fn run_connection(
        stream: TcpStream,
        coordinator: &TransactionCoordinator,
        listening: &AtomicBool,
        shutdown_rx: &mut watch::Receiver<bool>,
        order_rx: &Mutex<mpsc::Receiver<OrderRequest>>,
    ) {
        let mut link = AstmLink::new(stream);
        let mut orders = order_rx.lock().await;

        loop {
            if !listening.load(Ordering::SeqCst) {
                break;
            }

            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                Some(order) = orders.recv() => {
                    let result = tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => {
                            // Dropping `order.done` reports the aborted
                            // delivery to the LAB-28 caller
                            log::debug!("Shutdown requested mid-order, closing connection");
                            break;
                        }
                        result = link.send_message(&order.records) => result,
                    };
                    let fatal = matches!(
                        &result,
                        Err(ProtocolError::IoError(_)) | Err(ProtocolError::ConnectionClosed)
                    );
                    let _ = order.done.send(result.map_err(|e| e.to_string()));
                    if fatal {
                        log::warn!("Connection lost while sending an order");
                        break;
                    }
                }
                idle = link.wait_for_enquiry() => match idle {
                    Ok(IdleEvent::Disconnected) => {
                        log::info!("Analyzer closed the connection");
                        break;
                    }
                    Ok(IdleEvent::Enquiry) => {
                        tokio::select! {
                            biased;
                            _ = shutdown_rx.changed() => {
                                log::debug!("Shutdown requested mid-receive, closing connection");
                                break;
                            }
                            keep_alive = Self::handle_exchange(&mut link, coordinator) => {
                                if !keep_alive {
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!("Link failure while idle: {}", e);
                        break;
                    }
                }
            }
        }
    }

    /// Receive one message after an ENQ, dispatch it and transmit the
    /// reply. Returns false when the connection must be torn down.
    async fn handle_exchange(
        link: &mut AstmLink<TcpStream>,
        coordinator: &TransactionCoordinator,
    ) -> bool {
        match link.receive_after_enquiry().await {
            Ok(message) if !message.is_empty() => {
                log::info!("ASTM message received ({} bytes)", message.len());
                if let Some(reply) = coordinator.dispatch_astm(&message).await {
                    match link.send_message(&reply).await {
                        Ok(()) => log::debug!("Reply delivered to analyzer"),
                        Err(ProtocolError::IoError(_))
                        | Err(ProtocolError::ConnectionClosed) => {
                            log::error!("Connection lost while replying");
                            return false;
                        }
                        Err(e) => {
                            log::error!("Reply not accepted by analyzer: {}", e);
                        }
                    }
                }
                true
            }
            Ok(_) => {
                log::debug!("Empty transmission ignored");
                true
            }
            Err(e) => {
                // Truncated frames and transport errors tear the connection
                // down (the supervisor level reconnects); the link layer
                // already NAKed recoverable checksum failures.
                log::warn!("Receive aborted: {}", e);
                false
            }
        }
    }
}
