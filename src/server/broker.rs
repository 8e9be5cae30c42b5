//! TCP Embedding Broker
//!
//! Accepts client connections on the public endpoint, forwards every encode
//! request to the worker pool tagged with the identity of its connection, and
//! lets the router deliver each reply back to the connection it came from.
//! `info` handshakes are answered by the connection task without a worker.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::{EmbeddingError, EmbeddingResult, EncoderDispatcher};
use crate::protocol::{
    peek_request_kind, serialize_reply, BackendInfo, ProtocolMessage, Reply, KIND_INFO,
};
use crate::server::config::ServerConfig;
use crate::server::router::{run_router, ConnectionId, Job, RouteControl};
use crate::server::worker::WorkerPool;

pub struct Broker {
    config: Arc<ServerConfig>,
    dispatcher: Arc<EncoderDispatcher>,
    listener: TcpListener,
    local_addr: SocketAddr,
    broker_id: Uuid,
}

impl Broker {
    /// Bind the public endpoint for the dispatcher's backend.
    ///
    /// The port comes from `network.port` when set, else from the backend
    /// directory entry for `dispatcher.backend()`.
    pub async fn bind(
        config: ServerConfig,
        dispatcher: EncoderDispatcher,
    ) -> EmbeddingResult<Self> {
        info!("🚀 Initializing TCP Embedding Broker");

        let port = match config.network.port {
            Some(port) => port,
            None => config.directory.port(dispatcher.backend()).ok_or_else(|| {
                EmbeddingError::ConfigError {
                    message: format!(
                        "backend '{}' has no port in the backend directory",
                        dispatcher.backend()
                    ),
                }
            })?,
        };

        let address = format!("{}:{}", config.network.host, port);
        let listener = TcpListener::bind(&address).await?;
        let local_addr = listener.local_addr()?;
        info!("📡 Broker bound to {}", local_addr);

        let broker_id = Uuid::new_v4();
        info!("🆔 Broker ID: {}", broker_id);

        Ok(Self {
            config: Arc::new(config),
            dispatcher: Arc::new(dispatcher),
            listener,
            local_addr,
            broker_id,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve forever
    pub async fn run(self) -> EmbeddingResult<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Serve until `shutdown` resolves, then close every connection, drain the
    /// worker pool and stop the router.
    pub async fn run_until<F: Future>(self, shutdown: F) -> EmbeddingResult<()> {
        let Broker {
            config,
            dispatcher,
            listener,
            local_addr,
            broker_id,
        } = self;

        let worker_count = config.performance.worker_threads.max(1);
        let queue_size = config.performance.message_queue_size.max(1);
        let (job_tx, job_rx) = flume::bounded::<Job>(queue_size);
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let backend_info = BackendInfo {
            backend: dispatcher.backend().to_string(),
            model: dispatcher.model_reference().to_string(),
            dimension: dispatcher.dimension().unwrap_or(0),
            workers: worker_count,
        };
        // Handshakes are answered by the connection itself so they never wait
        // behind busy workers.
        let info_reply = Arc::new(serialize_reply(&Reply::Info(backend_info.clone()))?);
        let pool = WorkerPool::start(
            worker_count,
            Arc::clone(&dispatcher),
            backend_info,
            job_rx,
            reply_tx,
        )?;
        info!("👷 Started {} workers for backend '{}'", pool.size(), dispatcher.backend());

        let router = tokio::spawn(run_router(control_rx, reply_rx));

        let connection_limiter = Arc::new(Semaphore::new(config.network.max_connections));
        let max_message_size = config.network.max_message_size;
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        info!("🚀 Listening on {}", local_addr);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("🛑 Shutdown requested");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("✅ New connection from {}", addr);

                        let permit = match Arc::clone(&connection_limiter).try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(_) => {
                                warn!("⚠️  Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                        };

                        let channels = ConnectionChannels {
                            jobs: job_tx.clone(),
                            control: control_tx.clone(),
                            info_reply: Arc::clone(&info_reply),
                        };
                        connections.spawn(async move {
                            let result =
                                handle_connection(stream, addr, channels, max_message_size).await;
                            if let Err(e) = result {
                                error!("❌ Connection handler error for {}: {}", addr, e);
                            }
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        error!("❌ Accept error: {}", e);
                        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
                    }
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!("❌ Connection task panicked: {}", e);
                        }
                    }
                }
            }
        }

        connections.shutdown().await;
        drop(control_tx);
        drop(job_tx);

        info!("👷 Waiting for {} workers to finish", pool.alive());
        if tokio::task::spawn_blocking(move || pool.join()).await.is_err() {
            error!("❌ Failed to join worker pool");
        }
        if let Err(e) = router.await {
            error!("❌ Router task failed: {}", e);
        }

        info!("👋 Broker {} stopped", broker_id);
        Ok(())
    }

    /// Run the broker on the current runtime and return a handle to stop it.
    /// Dropping the handle also stops the broker.
    pub fn spawn(self) -> BrokerHandle {
        let local_addr = self.local_addr;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(self.run_until(async move {
            let _ = shutdown_rx.await;
        }));
        BrokerHandle {
            local_addr,
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Handle to a broker started with [`Broker::spawn`]
pub struct BrokerHandle {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<EmbeddingResult<()>>,
}

impl BrokerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the broker and wait until its workers have exited
    pub async fn shutdown(self) -> EmbeddingResult<()> {
        let _ = self.shutdown.send(());
        self.task.await.map_err(|e| EmbeddingError::Internal {
            message: format!("broker task failed: {}", e),
        })?
    }
}

/// What a connection task needs from the broker
struct ConnectionChannels {
    jobs: flume::Sender<Job>,
    control: mpsc::UnboundedSender<RouteControl>,
    /// Serialized `BackendInfo` reply for handshakes
    info_reply: Arc<Vec<u8>>,
}

/// Read frames from one client and queue them for the workers. Replies reach
/// the client through the writer task registered with the router.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    channels: ConnectionChannels,
    max_message_size: usize,
) -> EmbeddingResult<()> {
    let ConnectionChannels {
        jobs,
        control,
        info_reply,
    } = channels;
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let identity = ConnectionId::new();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let outbound = outbound_tx.clone();
    control
        .send(RouteControl::Register {
            identity,
            outbound: outbound_tx,
        })
        .map_err(|_| EmbeddingError::Internal {
            message: "router is not running".to_string(),
        })?;
    let writer = tokio::spawn(write_replies(write_half, outbound_rx, addr));
    debug!("🔌 Connection {} registered for {}", identity, addr);

    loop {
        let request = match ProtocolMessage::read_from(&mut reader, max_message_size).await {
            Ok(message) => message,
            Err(e) => {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    debug!("🔌 Client {} disconnected", addr);
                } else {
                    warn!("❌ Protocol error from {}: {}", addr, e);
                }
                break;
            }
        };

        debug!("📨 Received message from {} (ID: {})", addr, request.message_id);

        if peek_request_kind(&request.payload).as_deref() == Some(KIND_INFO) {
            let reply = ProtocolMessage::reply(request.message_id, info_reply.as_ref().clone());
            if outbound.send(reply).is_err() {
                break;
            }
            continue;
        }

        if jobs.is_full() {
            warn!("⏳ Job queue full, stalling {}", addr);
        }
        let job = Job {
            identity,
            message_id: request.message_id,
            payload: request.payload,
        };
        if jobs.send_async(job).await.is_err() {
            debug!("Worker pool closed, dropping connection {}", addr);
            break;
        }
    }

    let _ = control.send(RouteControl::Deregister { identity });
    drop(outbound);
    if writer.await.is_err() {
        debug!("Writer for {} was cancelled", addr);
    }
    Ok(())
}

async fn write_replies(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<ProtocolMessage>,
    addr: SocketAddr,
) {
    while let Some(message) = outbound.recv().await {
        if let Err(e) = message.write_to(&mut writer).await {
            debug!("Failed to write reply to {}: {}", addr, e);
            break;
        }
        debug!("📤 Reply sent to {}", addr);
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Embedding, ModelInfo, TextEncoder, TextInput};
    use crate::protocol::{deserialize_reply, serialize_request, Reply, Request};
    use crate::server::directory::BackendDirectory;

    struct Width {
        info: ModelInfo,
    }

    impl TextEncoder for Width {
        fn info(&self) -> &ModelInfo {
            &self.info
        }

        fn encode(&self, texts: &[TextInput], _pooling: &str) -> EmbeddingResult<Vec<Embedding>> {
            Ok(texts.iter().map(|t| vec![t.joined().len() as f32, 1.0]).collect())
        }
    }

    fn dispatcher() -> EncoderDispatcher {
        EncoderDispatcher::from_encoder(Width {
            info: ModelInfo {
                name: "width".to_string(),
                model_path: "memory".to_string(),
                dimension: 2,
            },
        })
    }

    fn local_config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.network.host = "127.0.0.1".to_string();
        config.network.port = Some(0);
        config.performance.worker_threads = 2;
        config
    }

    #[tokio::test]
    async fn test_bind_requires_directory_entry() {
        let mut config = local_config();
        config.network.port = None;
        config.directory = BackendDirectory::new([("fasttext", 0u16)]);

        let result = Broker::bind(config, dispatcher()).await;
        assert!(matches!(result, Err(EmbeddingError::ConfigError { .. })));
    }

    #[tokio::test]
    async fn test_request_reply_over_tcp() {
        let broker = Broker::bind(local_config(), dispatcher()).await.unwrap();
        let handle = broker.spawn();

        let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let texts = vec![TextInput::from("four")];
        let request = ProtocolMessage::new(
            serialize_request(&Request::encode(&texts, None, None).unwrap()).unwrap(),
        );
        request.write_to(&mut stream).await.unwrap();

        let reply = ProtocolMessage::read_from(&mut stream, 1024).await.unwrap();
        assert_eq!(reply.reply_to, Some(request.message_id));
        match deserialize_reply(&reply.payload).unwrap() {
            Reply::Embeddings(rows) => assert_eq!(rows, vec![vec![4.0, 1.0]]),
            other => panic!("unexpected reply {:?}", other),
        }

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_info_reports_worker_count() {
        let handle = Broker::bind(local_config(), dispatcher()).await.unwrap().spawn();

        let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let request = ProtocolMessage::new(serialize_request(&Request::info()).unwrap());
        request.write_to(&mut stream).await.unwrap();

        let reply = ProtocolMessage::read_from(&mut stream, 1024).await.unwrap();
        match deserialize_reply(&reply.payload).unwrap() {
            Reply::Info(info) => {
                assert_eq!(info.backend, "width");
                assert_eq!(info.dimension, 2);
                assert_eq!(info.workers, 2);
            }
            other => panic!("unexpected reply {:?}", other),
        }

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_frame_closes_connection() {
        let handle = Broker::bind(local_config(), dispatcher()).await.unwrap().spawn();

        let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let result = ProtocolMessage::read_from(&mut stream, 1024).await;
        assert!(result.is_err());

        handle.shutdown().await.unwrap();
    }
}
