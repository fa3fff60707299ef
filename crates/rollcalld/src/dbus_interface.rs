use crate::config::Config;
use crate::engine::{EngineError, EngineHandle};
use rollcall_core::{Enrollment, ImageInput, ServiceError, StoreError, StoreId, Strictness};
use std::path::PathBuf;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Rollcall1";
pub const OBJECT_PATH: &str = "/org/rollcall/Rollcall1";

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Rollcall1
/// Object path: /org/rollcall/Rollcall1
///
/// Images travel as encoded bytes (`ay`); results are JSON strings.
pub struct RollcallService {
    engine: EngineHandle,
    config: Config,
}

impl RollcallService {
    pub fn new(engine: EngineHandle, config: Config) -> Self {
        Self { engine, config }
    }
}

#[interface(name = "org.rollcall.Rollcall1")]
impl RollcallService {
    /// Face boxes and confidences found in an image.
    async fn detect(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        let faces = self
            .engine
            .detect(ImageInput::Encoded(image))
            .await
            .map_err(to_fdo)?;
        to_json(&faces)
    }

    /// Identify every face in an image against one group.
    async fn recognize(&self, owner: &str, group: &str, image: Vec<u8>) -> zbus::fdo::Result<String> {
        let store = store_id(owner, group)?;
        tracing::info!(store = %store, "recognize requested");
        let matches = self
            .engine
            .recognize(store, ImageInput::Encoded(image))
            .await
            .map_err(to_fdo)?;
        to_json(&matches)
    }

    /// Check a probe image against the claimed identity.
    async fn verify(&self, owner: &str, group: &str, key: &str, image: Vec<u8>) -> zbus::fdo::Result<String> {
        let store = store_id(owner, group)?;
        tracing::info!(store = %store, key, "verify requested");
        let outcome = self
            .engine
            .verify(store, key.to_string(), ImageInput::Encoded(image))
            .await
            .map_err(to_fdo)?;
        to_json(&outcome)
    }

    /// Enroll an identity from freshly supplied photos.
    async fn enroll(&self, owner: &str, group: &str, key: &str, images: Vec<Vec<u8>>) -> zbus::fdo::Result<String> {
        let store = store_id(owner, group)?;
        tracing::info!(store = %store, key, images = images.len(), "enroll requested");
        let images = images.into_iter().map(ImageInput::Encoded).collect();
        let enrollment = self
            .engine
            .enroll(store, key.to_string(), images, Strictness::Interactive)
            .await
            .map_err(to_fdo)?;
        Ok(enrollment_json(&enrollment))
    }

    /// Re-enroll an identity from a photo directory readable by the daemon.
    async fn enroll_from_dir(&self, owner: &str, group: &str, key: &str, dir: &str) -> zbus::fdo::Result<String> {
        let store = store_id(owner, group)?;
        tracing::info!(store = %store, key, dir, "enroll_from_dir requested");
        let enrollment = self
            .engine
            .enroll_from_dir(store, key.to_string(), PathBuf::from(dir))
            .await
            .map_err(to_fdo)?;
        Ok(enrollment_json(&enrollment))
    }

    /// Copy an identity into another group. Empty `from_owner` searches all stores.
    async fn transfer(
        &self,
        key: &str,
        from_owner: &str,
        from_group: &str,
        to_owner: &str,
        to_group: &str,
    ) -> zbus::fdo::Result<bool> {
        let from = if from_owner.is_empty() {
            None
        } else {
            Some(store_id(from_owner, from_group)?)
        };
        let to = store_id(to_owner, to_group)?;
        tracing::info!(key, to = %to, "transfer requested");
        self.engine
            .transfer(key.to_string(), from, to)
            .await
            .map_err(to_fdo)?;
        Ok(true)
    }

    /// Enrolled identity keys of one group, in enrollment order.
    async fn list_identities(&self, owner: &str, group: &str) -> zbus::fdo::Result<String> {
        let store = store_id(owner, group)?;
        let keys = self.engine.list_identities(store).await.map_err(to_fdo)?;
        to_json(&keys)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let rec = &self.config.recognition;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "model_dir": self.config.model_dir,
            "store_dir": self.config.store_dir,
            "similarity_threshold": rec.similarity_threshold,
            "enroll_confidence_floor": rec.enroll_confidence_floor,
            "probe_confidence_floor": rec.probe_confidence_floor,
            "verify_scope": rec.verify_scope,
            "key_scheme": rec.key_scheme,
            "inference_timeout_secs": self.config.inference_timeout_secs,
        })
        .to_string())
    }
}

fn store_id(owner: &str, group: &str) -> zbus::fdo::Result<StoreId> {
    StoreId::new(owner, group).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn enrollment_json(enrollment: &Enrollment) -> String {
    serde_json::json!({
        "images_used": enrollment.images_used,
        "skipped": enrollment.skipped,
    })
    .to_string()
}

/// Caller mistakes become `InvalidArgs`; timeouts stay distinguishable for retry.
fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    let message = err.to_string();
    if err.is_retryable() {
        tracing::warn!(error = %message, "request timed out");
        return zbus::fdo::Error::TimedOut(message);
    }
    match err {
        EngineError::Service(
            ServiceError::Image(_)
            | ServiceError::InvalidKey(_)
            | ServiceError::Store(StoreError::InvalidStoreId(_)),
        ) => zbus::fdo::Error::InvalidArgs(message),
        EngineError::Service(
            ServiceError::NoValidFaces { .. }
            | ServiceError::NoEmbeddingsForGroup(_)
            | ServiceError::IdentityNotEnrolled(_),
        ) => {
            tracing::info!(error = %message, "request rejected");
            zbus::fdo::Error::Failed(message)
        }
        EngineError::Service(ServiceError::NoEnrollmentImages(_)) => zbus::fdo::Error::FileNotFound(message),
        other => {
            tracing::error!(error = %other, "request failed");
            zbus::fdo::Error::Failed(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::types::KeyError;
    use std::time::Duration;

    #[test]
    fn test_timeout_maps_to_timed_out() {
        let err = to_fdo(EngineError::Timeout(Duration::from_secs(30)));
        assert!(matches!(err, zbus::fdo::Error::TimedOut(_)));
    }

    #[test]
    fn test_bad_arguments_map_to_invalid_args() {
        let err = to_fdo(EngineError::Service(ServiceError::InvalidKey(KeyError::Empty)));
        assert!(matches!(err, zbus::fdo::Error::InvalidArgs(_)));

        let bad_store = StoreId::new("../etc", "math").unwrap_err();
        let err = to_fdo(EngineError::Service(ServiceError::Store(bad_store)));
        assert!(matches!(err, zbus::fdo::Error::InvalidArgs(_)));
    }

    #[test]
    fn test_missing_directory_maps_to_file_not_found() {
        let err = to_fdo(EngineError::Service(ServiceError::NoEnrollmentImages(PathBuf::from(
            "/srv/photos/alice",
        ))));
        assert!(matches!(err, zbus::fdo::Error::FileNotFound(_)));
    }

    #[test]
    fn test_rejections_map_to_failed_with_message() {
        let err = to_fdo(EngineError::Service(ServiceError::IdentityNotEnrolled("alice".into())));
        match err {
            zbus::fdo::Error::Failed(message) => assert!(message.contains("alice")),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert!(matches!(to_fdo(EngineError::ChannelClosed), zbus::fdo::Error::Failed(_)));
    }
}
