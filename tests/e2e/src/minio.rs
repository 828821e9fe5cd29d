//! MinIO server for exercising the S3 backend

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use tokio::sync::OnceCell;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fs_mount::backend::s3::S3Backend;

const MINIO_IMAGE: &str = "minio/minio:latest";
const MINIO_CONTAINER_NAME: &str = "fs-mount-e2e-minio";
const DEFAULT_ACCESS_KEY: &str = "minioadmin";
const DEFAULT_SECRET_KEY: &str = "minioadmin";
const DEFAULT_PORT: u16 = 9000;
const READY_ATTEMPTS: u32 = 30;

/// Endpoint of the server every test in this process talks to
static ENDPOINT: OnceCell<String> = OnceCell::const_new();

fn credentials() -> (String, String) {
    (
        env::var("MINIO_ACCESS_KEY").unwrap_or_else(|_| DEFAULT_ACCESS_KEY.to_string()),
        env::var("MINIO_SECRET_KEY").unwrap_or_else(|_| DEFAULT_SECRET_KEY.to_string()),
    )
}

/// A client for a reachable MinIO server
///
/// The server is located (or started) once per test process. A container
/// started here is left running so later runs reuse it; remove it with
/// `docker rm -f fs-mount-e2e-minio`.
pub struct MinioContainer {
    s3_client: S3Client,
}

impl MinioContainer {
    /// Connect to MinIO, starting a container when needed.
    ///
    /// Environment variables:
    /// - `MINIO_ENDPOINT`: use the server at this URL instead of Docker
    /// - `MINIO_ACCESS_KEY` / `MINIO_SECRET_KEY`: credentials (default `minioadmin`)
    pub async fn start() -> Result<Self> {
        let (access_key, secret_key) = credentials();
        let endpoint = ENDPOINT
            .get_or_try_init(|| Self::locate(&access_key, &secret_key))
            .await?
            .clone();

        // Clients are per test: each #[tokio::test] runs its own runtime
        let s3_client = Self::client(&endpoint, &access_key, &secret_key);
        Self::wait_until_ready(&s3_client).await?;

        Ok(Self { s3_client })
    }

    async fn locate(access_key: &str, secret_key: &str) -> Result<String> {
        if let Ok(endpoint) = env::var("MINIO_ENDPOINT") {
            info!("Using MinIO at {}", endpoint);
            return Ok(endpoint);
        }

        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker; set MINIO_ENDPOINT to use a running server")?;

        if Self::find_container(&docker).await?.is_none() {
            Self::create_container(&docker, access_key, secret_key).await?;
        }
        Ok(format!("http://localhost:{}", DEFAULT_PORT))
    }

    /// Id of a container left over from an earlier run, restarted if stopped
    async fn find_container(docker: &Docker) -> Result<Option<String>> {
        let containers = docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .context("Failed to list containers")?;

        let Some(id) = containers
            .iter()
            .find(|c| {
                c.names
                    .as_ref()
                    .is_some_and(|names| names.iter().any(|n| n.contains(MINIO_CONTAINER_NAME)))
            })
            .and_then(|c| c.id.clone())
        else {
            return Ok(None);
        };

        info!("Reusing MinIO container {}", id);
        let inspect = docker.inspect_container(&id, None).await?;
        let running = inspect
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        if !running {
            docker
                .start_container(&id, None::<StartContainerOptions<String>>)
                .await?;
        }
        Ok(Some(id))
    }

    async fn create_container(docker: &Docker, access_key: &str, secret_key: &str) -> Result<String> {
        info!("Pulling {}", MINIO_IMAGE);
        let mut pull = docker.create_image(
            Some(CreateImageOptions {
                from_image: MINIO_IMAGE,
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            if let Err(e) = progress {
                warn!("Image pull warning: {}", e);
            }
        }

        let port_bindings = HashMap::from([(
            "9000/tcp".to_string(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(DEFAULT_PORT.to_string()),
            }]),
        )]);

        let root_user = format!("MINIO_ROOT_USER={}", access_key);
        let root_password = format!("MINIO_ROOT_PASSWORD={}", secret_key);
        let config = Config {
            image: Some(MINIO_IMAGE),
            env: Some(vec![root_user.as_str(), root_password.as_str()]),
            cmd: Some(vec!["server", "/data"]),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container = docker
            .create_container(
                Some(CreateContainerOptions {
                    name: MINIO_CONTAINER_NAME,
                    platform: None,
                }),
                config,
            )
            .await
            .context("Failed to create MinIO container")?;

        docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start MinIO container")?;

        info!("MinIO container started: {}", container.id);
        Ok(container.id)
    }

    fn client(endpoint: &str, access_key: &str, secret_key: &str) -> S3Client {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .endpoint_url(endpoint)
            .credentials_provider(Credentials::new(access_key, secret_key, None, None, "e2e"))
            .force_path_style(true)
            .build();
        S3Client::from_conf(config)
    }

    async fn wait_until_ready(client: &S3Client) -> Result<()> {
        for attempt in 1..=READY_ATTEMPTS {
            match client.list_buckets().send().await {
                Ok(_) => return Ok(()),
                Err(e) if attempt == READY_ATTEMPTS => {
                    return Err(anyhow::anyhow!(
                        "MinIO not ready after {} attempts: {}",
                        READY_ATTEMPTS,
                        e
                    ));
                }
                Err(e) => {
                    debug!("MinIO not ready yet (attempt {}): {}", attempt, e);
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
        Ok(())
    }

    /// Create an empty bucket with a unique name
    pub async fn create_test_bucket(&self) -> Result<TestBucket> {
        let name = format!("fs-mount-e2e-{}", Uuid::new_v4());
        self.s3_client
            .create_bucket()
            .bucket(&name)
            .send()
            .await
            .context("Failed to create test bucket")?;

        debug!("Created test bucket {}", name);
        Ok(TestBucket {
            name,
            s3_client: self.s3_client.clone(),
        })
    }
}

/// A scratch bucket plus direct access to its objects
pub struct TestBucket {
    name: String,
    s3_client: S3Client,
}

impl TestBucket {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// An [`S3Backend`] over this bucket sharing the test client
    pub fn backend(&self) -> S3Backend {
        S3Backend::from_client(self.s3_client.clone(), self.name.clone())
    }

    /// Every key under `prefix`, sorted
    pub async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token = None;

        loop {
            let response = self
                .s3_client
                .list_objects_v2()
                .bucket(&self.name)
                .prefix(prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key())
                    .map(str::to_string),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        keys.sort();
        Ok(keys)
    }

    pub async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let response = self
            .s3_client
            .get_object()
            .bucket(&self.name)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to get {}", key))?;

        Ok(response.body.collect().await?.into_bytes().to_vec())
    }

    pub async fn object_exists(&self, key: &str) -> Result<bool> {
        match self
            .s3_client
            .head_object()
            .bucket(&self.name)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(service_error.into())
                }
            }
        }
    }

    /// Write an object behind the backend's back
    pub async fn put_object(&self, key: &str, data: &[u8]) -> Result<()> {
        self.s3_client
            .put_object()
            .bucket(&self.name)
            .key(key)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .with_context(|| format!("Failed to put {}", key))?;
        Ok(())
    }

    /// Delete every object, then the bucket itself
    pub async fn cleanup(self) -> Result<()> {
        for key in self.list_objects("").await? {
            self.s3_client
                .delete_object()
                .bucket(&self.name)
                .key(&key)
                .send()
                .await
                .with_context(|| format!("Failed to delete {}", key))?;
        }

        self.s3_client
            .delete_bucket()
            .bucket(&self.name)
            .send()
            .await
            .context("Failed to delete bucket")?;
        Ok(())
    }
}
