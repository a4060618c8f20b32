//! Container image management: pull, list, remove.

use crate::container::{ContainerError, Result};
use bollard::Docker;
use futures::stream::StreamExt;
use tracing::{debug, info};

/// Default runtime image used when a Runtime record doesn't override it.
pub const AGENTBOX_DEFAULT_IMAGE: &str = "agentbox/workspace:latest";

/// Image operations against the container engine.
pub struct ImageBuilder {
    docker: Docker,
}

impl ImageBuilder {
    /// Create a new image builder.
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Check if an image exists locally.
    ///
    /// # Errors
    ///
    /// Returns error if image inspection fails.
    pub async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            }) => Ok(false),
            Err(e) => Err(ContainerError::ApiError(e)),
        }
    }

    /// Pull an image from a registry.
    ///
    /// # Errors
    ///
    /// Returns error if image pull fails.
    pub async fn pull_image(&self, image: &str) -> Result<()> {
        info!("Pulling image: {}", image);

        let mut stream = self.docker.create_image(
            Some(bollard::image::CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("Pull: {}", status);
                    }
                    if let Some(error) = info.error {
                        return Err(ContainerError::Other(format!("Pull failed: {}", error)));
                    }
                }
                Err(e) => {
                    return Err(ContainerError::ApiError(e));
                }
            }
        }

        info!("Successfully pulled image: {}", image);
        Ok(())
    }

    /// Remove an image.
    ///
    /// # Errors
    ///
    /// Returns error if image removal fails.
    pub async fn remove_image(&self, image: &str, force: bool) -> Result<()> {
        info!("Removing image: {}", image);

        self.docker
            .remove_image(
                image,
                Some(bollard::image::RemoveImageOptions {
                    force,
                    ..Default::default()
                }),
                None,
            )
            .await?;

        info!("Successfully removed image: {}", image);
        Ok(())
    }

    /// List all images.
    ///
    /// # Errors
    ///
    /// Returns error if listing fails.
    pub async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        let images = self
            .docker
            .list_images(Some(bollard::image::ListImagesOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await?;

        Ok(images
            .into_iter()
            .map(|img| ImageInfo {
                id: img.id,
                repo_tags: img.repo_tags,
                size: img.size,
                created: img.created,
            })
            .collect())
    }

    /// Ensure the default runtime image is present locally, pulling it if not.
    ///
    /// # Errors
    ///
    /// Returns `ImageNotFound` if the image is absent and the pull fails.
    pub async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.image_exists(image).await? {
            return Ok(());
        }
        self.pull_image(image)
            .await
            .map_err(|_| ContainerError::ImageNotFound(image.to_string()))
    }
}

/// Image information.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    /// Image ID
    pub id: String,
    /// Repository tags
    pub repo_tags: Vec<String>,
    /// Size in bytes
    pub size: i64,
    /// Creation timestamp
    pub created: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_image_exists() {
        use bollard::Docker;

        let docker = Docker::connect_with_local_defaults().unwrap();
        let builder = ImageBuilder::new(docker);

        // alpine should not exist initially (or might exist)
        let exists = builder.image_exists("alpine:latest").await.unwrap();
        println!("alpine:latest exists: {}", exists);
    }

    #[tokio::test]
    #[ignore]
    async fn test_list_images() {
        use bollard::Docker;

        let docker = Docker::connect_with_local_defaults().unwrap();
        let builder = ImageBuilder::new(docker);

        let images = builder.list_images().await.unwrap();
        println!("Found {} images", images.len());
        for img in images.iter().take(5) {
            println!("  {} - {:?}", img.id, img.repo_tags);
        }
    }
}
