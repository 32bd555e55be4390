use identint_core::{EncodedPhoto, FaceBackend, FaceError, Inspection};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Face(#[from] FaceError),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("cannot spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Inspect {
        path: PathBuf,
        reply: oneshot::Sender<Result<Inspection, FaceError>>,
    },
    Encode {
        path: PathBuf,
        reply: oneshot::Sender<Result<EncodedPhoto, FaceError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Quality-check an uploaded photo and encode it when it shows one face.
    pub async fn inspect(&self, path: PathBuf) -> Result<Inspection, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Inspect { path, reply }).await?;
        Ok(rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    /// Encode the first face of a student photo.
    pub async fn encode(&self, path: PathBuf) -> Result<EncodedPhoto, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Encode { path, reply }).await?;
        Ok(rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    async fn send(&self, request: EngineRequest) -> Result<(), EngineError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The backend's ONNX sessions are owned by that thread for their whole
/// life, so inference runs one photo at a time and never blocks the runtime.
pub fn spawn_engine<B>(mut backend: B) -> Result<EngineHandle, EngineError>
where
    B: FaceBackend + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(8);

    std::thread::Builder::new()
        .name("identint-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Inspect { path, reply } => {
                        let result = identint_core::inspect_photo(&mut backend, &path);
                        if let Err(err) = &result {
                            tracing::warn!(
                                path = %path.display(),
                                error = %err,
                                "inspection failed"
                            );
                        }
                        let _ = reply.send(result);
                    }
                    EngineRequest::Encode { path, reply } => {
                        let result = identint_core::encode_photo(&mut backend, &path);
                        if let Err(err) = &result {
                            tracing::warn!(path = %path.display(), error = %err, "encoding failed");
                        }
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}
