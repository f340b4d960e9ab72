use std::sync::Arc;

use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::application::repos::{RepoError, UploadRecord, UploadsWriteRepo};
use crate::cache::{CacheCoordinator, CoordinatorError};
use crate::domain::NodeId;
use crate::domain::error::DomainError;

#[derive(Debug, Error)]
pub enum UploadServiceError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

#[derive(Clone)]
pub struct UploadService {
    writer: Arc<dyn UploadsWriteRepo>,
    cache: Arc<CacheCoordinator>,
}

impl UploadService {
    pub fn new(writer: Arc<dyn UploadsWriteRepo>, cache: Arc<CacheCoordinator>) -> Self {
        Self { writer, cache }
    }

    pub async fn upload(
        &self,
        category: NodeId,
        filename: &str,
        size_bytes: u64,
    ) -> Result<UploadRecord, UploadServiceError> {
        if !self.cache.hierarchy().contains(category) {
            return Err(DomainError::not_found("category", category).into());
        }
        if filename.trim().is_empty() {
            return Err(DomainError::validation("filename must not be empty").into());
        }

        let _mutation = self.cache.begin_mutation().await;
        let upload = self.writer.create_upload(category, filename, size_bytes).await?;
        self.cache.on_file_uploaded(upload.category, upload.size_bytes)?;
        info!(upload = %upload.id, category = %category, size_bytes, "Attachment stored");
        Ok(upload)
    }

    pub async fn delete(&self, id: Uuid) -> Result<UploadRecord, UploadServiceError> {
        let _mutation = self.cache.begin_mutation().await;
        let upload = self.writer.delete_upload(id).await?;
        self.cache.on_file_deleted(upload.category, upload.size_bytes)?;
        info!(upload = %upload.id, category = %upload.category, "Attachment removed");
        Ok(upload)
    }
}
