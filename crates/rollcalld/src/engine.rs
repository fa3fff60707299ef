use rollcall_core::{
    Enrollment, FaceDetection, FaceMatch, IdentityKey, ImageInput, RecognitionService, ServiceError, StoreId,
    Strictness, VerifyOutcome,
};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl EngineError {
    /// Whether the caller may simply try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Timeout(_))
    }
}

type Reply<T> = oneshot::Sender<Result<T, ServiceError>>;

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Detect {
        image: ImageInput,
        reply: Reply<Vec<FaceDetection>>,
    },
    Recognize {
        store: StoreId,
        image: ImageInput,
        reply: Reply<Vec<FaceMatch>>,
    },
    Verify {
        store: StoreId,
        key: String,
        image: ImageInput,
        reply: Reply<VerifyOutcome>,
    },
    Enroll {
        store: StoreId,
        key: String,
        images: Vec<ImageInput>,
        strictness: Strictness,
        reply: Reply<Enrollment>,
    },
    EnrollFromDir {
        store: StoreId,
        key: String,
        dir: PathBuf,
        reply: Reply<Enrollment>,
    },
    Transfer {
        key: String,
        from: Option<StoreId>,
        to: StoreId,
        reply: Reply<()>,
    },
    ListIdentities {
        store: StoreId,
        reply: Reply<Vec<IdentityKey>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    timeout: Duration,
}

impl EngineHandle {
    /// Queue a request and wait for its reply, both under the request timeout.
    ///
    /// A request that times out after being admitted still runs to completion;
    /// only its reply is dropped.
    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> EngineRequest) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = make(reply_tx);
        let exchange = async {
            self.tx
                .send(request)
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
            reply_rx.await.map_err(|_| EngineError::ChannelClosed)
        };
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(reply) => Ok(reply??),
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "engine request timed out");
                Err(EngineError::Timeout(self.timeout))
            }
        }
    }

    pub async fn detect(&self, image: ImageInput) -> Result<Vec<FaceDetection>, EngineError> {
        self.call(|reply| EngineRequest::Detect { image, reply }).await
    }

    pub async fn recognize(&self, store: StoreId, image: ImageInput) -> Result<Vec<FaceMatch>, EngineError> {
        self.call(|reply| EngineRequest::Recognize { store, image, reply })
            .await
    }

    pub async fn verify(&self, store: StoreId, key: String, image: ImageInput) -> Result<VerifyOutcome, EngineError> {
        self.call(|reply| EngineRequest::Verify {
            store,
            key,
            image,
            reply,
        })
        .await
    }

    pub async fn enroll(
        &self,
        store: StoreId,
        key: String,
        images: Vec<ImageInput>,
        strictness: Strictness,
    ) -> Result<Enrollment, EngineError> {
        self.call(|reply| EngineRequest::Enroll {
            store,
            key,
            images,
            strictness,
            reply,
        })
        .await
    }

    pub async fn enroll_from_dir(&self, store: StoreId, key: String, dir: PathBuf) -> Result<Enrollment, EngineError> {
        self.call(|reply| EngineRequest::EnrollFromDir {
            store,
            key,
            dir,
            reply,
        })
        .await
    }

    pub async fn transfer(&self, key: String, from: Option<StoreId>, to: StoreId) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::Transfer { key, from, to, reply })
            .await
    }

    pub async fn list_identities(&self, store: StoreId) -> Result<Vec<IdentityKey>, EngineError> {
        self.call(|reply| EngineRequest::ListIdentities { store, reply })
            .await
    }
}

/// Move the service onto a dedicated OS thread and return a handle to it.
///
/// At most `queue_depth` requests wait in the queue; further callers wait
/// for a slot, bounded by `timeout`.
pub fn spawn_engine(
    service: RecognitionService,
    queue_depth: usize,
    timeout: Duration,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(queue_depth.max(1));

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                handle(&service, req);
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx, timeout })
}

/// Run one request. A dropped receiver means the caller timed out.
fn handle(service: &RecognitionService, req: EngineRequest) {
    match req {
        EngineRequest::Detect { image, reply } => {
            let _ = reply.send(service.detect(&image));
        }
        EngineRequest::Recognize { store, image, reply } => {
            let _ = reply.send(service.recognize(&store, &image));
        }
        EngineRequest::Verify {
            store,
            key,
            image,
            reply,
        } => {
            let _ = reply.send(service.verify(&store, &key, &image));
        }
        EngineRequest::Enroll {
            store,
            key,
            images,
            strictness,
            reply,
        } => {
            let _ = reply.send(service.enroll(&store, &key, &images, strictness));
        }
        EngineRequest::EnrollFromDir {
            store,
            key,
            dir,
            reply,
        } => {
            let _ = reply.send(service.enroll_from_dir(&store, &key, &dir));
        }
        EngineRequest::Transfer { key, from, to, reply } => {
            let _ = reply.send(service.transfer_identity(&key, from.as_ref(), &to));
        }
        EngineRequest::ListIdentities { store, reply } => {
            let _ = reply.send(service.list_identities(&store));
        }
    }
}
