//! Worker threads
//!
//! Each worker is an OS thread that pulls jobs from the shared queue, runs
//! them through the encoder dispatcher and hands the serialized reply back to
//! the router. A worker that is busy simply does not pull, so the queue hands
//! each job to whichever worker is idle next.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::models::{EmbeddingError, EmbeddingResult, EncoderDispatcher, MEAN_POOLING};
use crate::protocol::{
    deserialize_request, serialize_reply, BackendInfo, Reply, Request, KIND_ENCODE, KIND_INFO,
};
use crate::server::router::{Job, WorkerReply};

pub struct Worker {
    id: usize,
    dispatcher: Arc<EncoderDispatcher>,
    backend_info: BackendInfo,
}

impl Worker {
    pub fn new(id: usize, dispatcher: Arc<EncoderDispatcher>, backend_info: BackendInfo) -> Self {
        Self {
            id,
            dispatcher,
            backend_info,
        }
    }

    /// Serve jobs until the queue closes or the router goes away.
    pub fn run(self, jobs: flume::Receiver<Job>, replies: mpsc::UnboundedSender<WorkerReply>) {
        info!("[WORKER-{}]: ready and listening!", self.id);

        while let Ok(job) = jobs.recv() {
            debug!("[WORKER-{}]: computing request {}", self.id, job.message_id);
            let reply = self.process(&job.payload);
            let payload = match serialize_reply(&reply) {
                Ok(payload) => payload,
                Err(e) => {
                    error!("[WORKER-{}]: failed to serialize reply: {}", self.id, e);
                    match serialize_reply(&Reply::from(e)) {
                        Ok(payload) => payload,
                        Err(_) => continue,
                    }
                }
            };

            let reply = WorkerReply {
                identity: job.identity,
                reply_to: job.message_id,
                payload,
            };
            if replies.send(reply).is_err() {
                debug!("[WORKER-{}]: router closed", self.id);
                break;
            }
        }

        info!("[WORKER-{}]: stopped", self.id);
    }

    /// Compute the reply for one raw request. Never panics: a panic inside the
    /// encoder becomes an `INTERNAL_ERROR` reply.
    pub fn process(&self, payload: &[u8]) -> Reply {
        match catch_unwind(AssertUnwindSafe(|| self.compute(payload))) {
            Ok(reply) => reply,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("[WORKER-{}]: request panicked: {}", self.id, message);
                Reply::from(EmbeddingError::Internal {
                    message: format!("worker panicked: {}", message),
                })
            }
        }
    }

    fn compute(&self, payload: &[u8]) -> Reply {
        let request = match deserialize_request(payload) {
            Ok(request) => request,
            Err(e) => return Reply::from(e),
        };

        match request.kind.as_deref() {
            Some(KIND_ENCODE) => match self.encode(&request) {
                Ok(embeddings) => Reply::Embeddings(embeddings),
                Err(e) => {
                    debug!("[WORKER-{}]: encode failed: {}", self.id, e);
                    Reply::from(e)
                }
            },
            Some(KIND_INFO) => Reply::Info(self.backend_info.clone()),
            Some(other) => Reply::from(EmbeddingError::MalformedRequest {
                message: format!("unknown request type '{}'", other),
            }),
            None => Reply::from(EmbeddingError::MalformedRequest {
                message: "request has no `type` field".to_string(),
            }),
        }
    }

    fn encode(&self, request: &Request) -> EmbeddingResult<Vec<Vec<f32>>> {
        let texts = request.texts()?;
        let pooling = request.pooling.as_deref().unwrap_or(MEAN_POOLING);
        let batch_size = request
            .batch_size
            .unwrap_or_else(|| self.dispatcher.default_batch_size());
        self.dispatcher.encode(&texts, pooling, batch_size)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The fixed set of worker threads serving one broker
pub struct WorkerPool {
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        size: usize,
        dispatcher: Arc<EncoderDispatcher>,
        backend_info: BackendInfo,
        jobs: flume::Receiver<Job>,
        replies: mpsc::UnboundedSender<WorkerReply>,
    ) -> EmbeddingResult<Self> {
        let mut handles = Vec::with_capacity(size);
        for id in 0..size {
            let worker = Worker::new(id, Arc::clone(&dispatcher), backend_info.clone());
            let jobs = jobs.clone();
            let replies = replies.clone();
            let handle = thread::Builder::new()
                .name(format!("embedding-worker-{}", id))
                .spawn(move || worker.run(jobs, replies))?;
            handles.push(handle);
        }
        Ok(Self { handles })
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Workers whose thread has not exited
    pub fn alive(&self) -> usize {
        self.handles.iter().filter(|handle| !handle.is_finished()).count()
    }

    /// Wait for every worker to exit. Blocks; the job queue must already be
    /// closed.
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                error!("Worker thread exited abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Embedding, ModelInfo, TextEncoder, TextInput};
    use crate::protocol::{deserialize_reply, serialize_request, ErrorCode};
    use crate::server::router::ConnectionId;
    use uuid::Uuid;

    struct EchoLength {
        info: ModelInfo,
    }

    impl TextEncoder for EchoLength {
        fn info(&self) -> &ModelInfo {
            &self.info
        }

        fn encode(&self, texts: &[TextInput], pooling: &str) -> EmbeddingResult<Vec<Embedding>> {
            if pooling == "boom" {
                panic!("encoder exploded");
            }
            if pooling != "mean" {
                return Err(EmbeddingError::UnsupportedPooling { message: pooling.to_string() });
            }
            Ok(texts.iter().map(|t| vec![t.joined().len() as f32]).collect())
        }
    }

    fn worker() -> Worker {
        let dispatcher = EncoderDispatcher::from_encoder(EchoLength {
            info: ModelInfo {
                name: "stub".to_string(),
                model_path: "memory".to_string(),
                dimension: 1,
            },
        });
        let info = BackendInfo {
            backend: "stub".to_string(),
            model: "memory".to_string(),
            dimension: 1,
            workers: 1,
        };
        Worker::new(0, Arc::new(dispatcher), info)
    }

    fn request(kind: Option<&str>, texts: serde_json::Value, pooling: Option<&str>) -> Vec<u8> {
        serialize_request(&Request {
            kind: kind.map(str::to_string),
            texts: Some(texts),
            pooling: pooling.map(str::to_string),
            batch_size: Some(2),
        })
        .unwrap()
    }

    fn error_code(reply: Reply) -> ErrorCode {
        match reply {
            Reply::Error(response) => response.code,
            other => panic!("expected an error reply, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_request() {
        let payload = request(Some("encode"), serde_json::json!(["a", "abc", "ab"]), None);
        let reply = worker().process(&payload);
        match reply {
            Reply::Embeddings(rows) => assert_eq!(rows, vec![vec![1.0], vec![3.0], vec![2.0]]),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_info_request() {
        let payload = serialize_request(&Request::info()).unwrap();
        match worker().process(&payload) {
            Reply::Info(info) => assert_eq!(info.backend, "stub"),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_gets_explicit_error() {
        let reply = worker().process(&request(Some("train"), serde_json::json!(["a"]), None));
        assert_eq!(error_code(reply), ErrorCode::MalformedRequest);

        let reply = worker().process(&request(None, serde_json::json!(["a"]), None));
        assert_eq!(error_code(reply), ErrorCode::MalformedRequest);

        let reply = worker().process(b"not msgpack at all");
        assert_eq!(error_code(reply), ErrorCode::MalformedRequest);
    }

    #[test]
    fn test_encode_errors_become_replies() {
        let reply = worker().process(&request(Some("encode"), serde_json::json!("text"), None));
        assert_eq!(error_code(reply), ErrorCode::InvalidInput);

        let payload = request(Some("encode"), serde_json::json!(["a"]), Some("max"));
        let reply = worker().process(&payload);
        assert_eq!(error_code(reply), ErrorCode::UnsupportedPooling);
    }

    #[test]
    fn test_panics_are_contained() {
        let worker = worker();
        let payload = request(Some("encode"), serde_json::json!(["a"]), Some("boom"));
        let reply = worker.process(&payload);
        assert_eq!(error_code(reply), ErrorCode::InternalError);

        // the same worker keeps serving
        let reply = worker.process(&request(Some("encode"), serde_json::json!(["abcd"]), None));
        assert!(matches!(reply, Reply::Embeddings(rows) if rows == vec![vec![4.0]]));
    }

    #[test]
    fn test_worker_thread_round_trip() {
        let (job_tx, job_rx) = flume::bounded(4);
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let handle = thread::spawn(move || worker().run(job_rx, reply_tx));

        let identity = ConnectionId::new();
        let message_id = Uuid::new_v4();
        job_tx
            .send(Job {
                identity,
                message_id,
                payload: request(Some("encode"), serde_json::json!(["xyz"]), None),
            })
            .unwrap();
        drop(job_tx);
        handle.join().unwrap();

        let reply = reply_rx.try_recv().unwrap();
        assert_eq!(reply.identity, identity);
        assert_eq!(reply.reply_to, message_id);
        assert!(matches!(
            deserialize_reply(&reply.payload).unwrap(),
            Reply::Embeddings(rows) if rows == vec![vec![3.0]]
        ));
    }

    #[test]
    fn test_pool_exits_when_queue_closes() {
        let (job_tx, job_rx) = flume::unbounded();
        let (reply_tx, _reply_rx) = mpsc::unbounded_channel();
        let template = worker();
        let pool = WorkerPool::start(
            3,
            template.dispatcher,
            template.backend_info,
            job_rx,
            reply_tx,
        )
        .unwrap();
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.alive(), 3);
        drop(job_tx);
        pool.join();
    }
}
