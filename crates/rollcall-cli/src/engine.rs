use rollcall_core::{
    EnrollRequest, Enrollment, FaceEmbedder, IdentityStore, Matcher, Pipeline, PipelineError,
    Recognition, RecognizeRequest,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Messages sent to the engine thread.
enum EngineRequest {
    Enroll {
        request: EnrollRequest,
        reply: oneshot::Sender<Result<Enrollment, EngineError>>,
    },
    Recognize {
        request: RecognizeRequest,
        reply: oneshot::Sender<Result<Recognition, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    pub async fn enroll(&self, request: EnrollRequest) -> Result<Enrollment, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn recognize(&self, request: RecognizeRequest) -> Result<Recognition, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Recognize {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the pipeline and the embedder (and with it the ONNX
/// sessions) and serves requests one at a time until every handle is
/// dropped.
pub fn spawn_engine<S, M, E>(pipeline: Pipeline<S, M>, mut embedder: E) -> Result<EngineHandle, EngineError>
where
    S: IdentityStore + 'static,
    M: Matcher + 'static,
    E: FaceEmbedder + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll { request, reply } => {
                        tracing::debug!(email = %request.email, images = request.images.len(), "enroll request");
                        let result = pipeline.enroll(&mut embedder, &request).map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Recognize { request, reply } => {
                        tracing::debug!(captured_at = %request.captured_at, "recognize request");
                        let result = pipeline
                            .recognize(&mut embedder, &request)
                            .map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}
