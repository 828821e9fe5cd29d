//! End-to-end harness for the fs-mount S3 backend
//!
//! Each test gets a fresh bucket on a MinIO server and drives the backend
//! (or a translator over it) directly, checking the resulting objects with
//! a plain S3 client.
//!
//! ```ignore
//! use fs_mount_e2e::S3Harness;
//!
//! #[tokio::test]
//! async fn my_test() -> anyhow::Result<()> {
//!     let harness = S3Harness::new().await?;
//!     let backend = harness.backend();
//!     // ... exercise backend, inspect harness.bucket() ...
//!     harness.cleanup().await
//! }
//! ```
//!
//! Set `MINIO_ENDPOINT` to run against an existing server instead of a
//! Docker container.

pub mod minio;

use std::sync::Once;

use anyhow::Result;
use fs_mount::backend::s3::S3Backend;
use tracing_subscriber::EnvFilter;

pub use minio::{MinioContainer, TestBucket};

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// One scratch bucket on the shared MinIO server
pub struct S3Harness {
    bucket: TestBucket,
}

impl S3Harness {
    pub async fn new() -> Result<Self> {
        init_tracing();
        let minio = MinioContainer::start().await?;
        let bucket = minio.create_test_bucket().await?;
        Ok(Self { bucket })
    }

    pub fn bucket(&self) -> &TestBucket {
        &self.bucket
    }

    pub fn backend(&self) -> S3Backend {
        self.bucket.backend()
    }

    /// Delete the bucket and everything in it
    pub async fn cleanup(self) -> Result<()> {
        self.bucket.cleanup().await
    }
}
