//! Post-storage stages of an upload: metadata extraction, then detection.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::detection::{DetectionError, DetectionInvoker, DetectionJob};
use crate::metadata::{self, MetadataError, MetadataTagSet};
use crate::storage::{Storage, UploadedAsset};

/// Where an upload is in its lifecycle. Every edge can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStage {
    Received,
    Stored,
    MetadataExtracted,
    Detecting,
    Completed,
}

impl UploadStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Stored => "stored",
            Self::MetadataExtracted => "metadata_extracted",
            Self::Detecting => "detecting",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("error extracting metadata: {0}")]
    Metadata(#[from] MetadataError),
    #[error("error running detection: {0}")]
    Detection(#[from] DetectionError),
}

impl PipelineError {
    /// Worker exit code, when the failure was a non-zero exit.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Detection(error) => error.exit_code(),
            Self::Metadata(_) => None,
        }
    }

    /// The last stage reached before the failure.
    pub fn stage(&self) -> UploadStage {
        match self {
            Self::Metadata(_) => UploadStage::Stored,
            Self::Detection(_) => UploadStage::Detecting,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessedAsset {
    pub asset: UploadedAsset,
    pub output_path: PathBuf,
    pub metadata: MetadataTagSet,
}

#[derive(Clone)]
pub struct UploadPipeline {
    storage: Arc<Storage>,
    invoker: DetectionInvoker,
    timeout: Option<Duration>,
    cleanup_on_failure: bool,
}

impl UploadPipeline {
    pub fn new(
        storage: Arc<Storage>,
        invoker: DetectionInvoker,
        timeout: Option<Duration>,
        cleanup_on_failure: bool,
    ) -> Self {
        Self {
            storage,
            invoker,
            timeout,
            cleanup_on_failure,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Run the stages after storage for one asset.
    ///
    /// Metadata must parse before the worker is started. On failure the
    /// stored file stays on disk unless `cleanup_on_failure` is set.
    pub async fn process(
        &self,
        asset: UploadedAsset,
        session_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<ProcessedAsset, PipelineError> {
        let result = self.run_stages(&asset, session_id, cancel).await;

        match result {
            Ok(metadata) => {
                info!(
                    filename = %asset.generated_name,
                    stage = UploadStage::Completed.as_str(),
                    "Upload processed"
                );
                Ok(ProcessedAsset {
                    output_path: self.storage.detected_path(&asset),
                    asset,
                    metadata,
                })
            }
            Err(error) => {
                warn!(
                    filename = %asset.generated_name,
                    stage = error.stage().as_str(),
                    exit_code = ?error.exit_code(),
                    error = %error,
                    "Upload processing failed"
                );
                if self.cleanup_on_failure {
                    self.storage.discard(&asset).await;
                }
                Err(error)
            }
        }
    }

    async fn run_stages(
        &self,
        asset: &UploadedAsset,
        session_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<MetadataTagSet, PipelineError> {
        let metadata = metadata::extract_async(asset.storage_path.clone()).await?;
        info!(
            filename = %asset.generated_name,
            stage = UploadStage::MetadataExtracted.as_str(),
            tags = metadata.len(),
            "Metadata extracted"
        );

        let job = DetectionJob::for_asset(&self.storage, asset, session_id);
        info!(
            filename = %asset.generated_name,
            stage = UploadStage::Detecting.as_str(),
            session_id = ?job.session_id,
            "Starting detection"
        );

        match self.timeout {
            Some(limit) => {
                // Dropping the invoke future on timeout kills the worker.
                tokio::time::timeout(limit, self.invoker.invoke(job, cancel))
                    .await
                    .map_err(|_| DetectionError::TimedOut(limit))??;
            }
            None => {
                self.invoker.invoke(job, cancel).await?;
            }
        }

        Ok(metadata)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::DetectorConfig;
    use crate::metadata::fixtures::jpeg_with_exif;
    use crate::notify::NotificationHub;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        temp: TempDir,
        pipeline: UploadPipeline,
    }

    async fn fixture(script: &str, timeout: Option<Duration>, cleanup: bool) -> Fixture {
        let temp = tempdir().expect("tempdir");
        let script_path = temp.path().join("worker.sh");
        std::fs::write(&script_path, script).expect("write worker script");

        let storage = Storage::open(&temp.path().join("uploads"), &temp.path().join("detected"))
            .await
            .expect("open storage");
        let detector = DetectorConfig {
            program: PathBuf::from("/bin/sh"),
            args: vec![script_path.display().to_string()],
            working_dir: Some(temp.path().to_path_buf()),
            timeout_secs: None,
        };
        let invoker = DetectionInvoker::new(detector, Arc::new(NotificationHub::new()));

        Fixture {
            pipeline: UploadPipeline::new(Arc::new(storage), invoker, timeout, cleanup),
            temp,
        }
    }

    #[tokio::test]
    async fn successful_run_returns_metadata_and_output_path() {
        let fx = fixture("cp \"$1\" \"$2\"\n", None, false).await;
        let asset = fx
            .pipeline
            .storage()
            .store(jpeg_with_exif().as_slice(), "cam.jpg")
            .await
            .expect("store");

        let processed = fx
            .pipeline
            .process(asset.clone(), None, &CancellationToken::new())
            .await
            .expect("pipeline succeeds");

        assert_eq!(processed.asset, asset);
        assert_eq!(processed.metadata.get("Make"), Some(&serde_json::json!("Test")));
        assert_eq!(
            std::fs::read(&processed.output_path).unwrap(),
            jpeg_with_exif()
        );
    }

    #[tokio::test]
    async fn unparseable_upload_never_reaches_the_worker() {
        let fx = fixture("touch invoked\ncp \"$1\" \"$2\"\n", None, false).await;
        let asset = fx
            .pipeline
            .storage()
            .store(&b"not an image"[..], "fake.jpg")
            .await
            .expect("store");

        let err = fx
            .pipeline
            .process(asset.clone(), None, &CancellationToken::new())
            .await
            .expect_err("metadata failure");

        assert!(matches!(err, PipelineError::Metadata(_)));
        assert_eq!(err.stage(), UploadStage::Stored);
        assert_eq!(err.exit_code(), None);
        assert!(!fx.temp.path().join("invoked").exists());
        assert!(asset.storage_path.exists(), "upload is retained by default");
    }

    #[tokio::test]
    async fn worker_failure_surfaces_as_detection_error() {
        let fx = fixture("exit 1\n", None, false).await;
        let asset = fx
            .pipeline
            .storage()
            .store(jpeg_with_exif().as_slice(), "cam.jpg")
            .await
            .expect("store");

        let err = fx
            .pipeline
            .process(asset, None, &CancellationToken::new())
            .await
            .expect_err("exit 1 must fail");
        assert!(matches!(
            err,
            PipelineError::Detection(DetectionError::Exited { code: Some(1), .. })
        ));
        assert_eq!(err.stage(), UploadStage::Detecting);
        assert_eq!(err.exit_code(), Some(1));
    }

    #[tokio::test]
    async fn timeout_stops_a_slow_worker() {
        let fx = fixture("sleep 30\n", Some(Duration::from_millis(200)), false).await;
        let asset = fx
            .pipeline
            .storage()
            .store(jpeg_with_exif().as_slice(), "cam.jpg")
            .await
            .expect("store");

        let err = fx
            .pipeline
            .process(asset, None, &CancellationToken::new())
            .await
            .expect_err("timeout");
        assert!(matches!(
            err,
            PipelineError::Detection(DetectionError::TimedOut(_))
        ));
    }

    #[tokio::test]
    async fn cleanup_policy_removes_failed_upload_and_partial_output() {
        let fx = fixture("echo partial > \"$2\"\nexit 2\n", None, true).await;
        let asset = fx
            .pipeline
            .storage()
            .store(jpeg_with_exif().as_slice(), "cam.jpg")
            .await
            .expect("store");
        let output = fx.pipeline.storage().detected_path(&asset);

        fx.pipeline
            .process(asset.clone(), None, &CancellationToken::new())
            .await
            .expect_err("exit 2 must fail");

        assert!(!asset.storage_path.exists());
        assert!(!output.exists());
    }
}
