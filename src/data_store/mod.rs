//! Object-store backend for chunk blobs and chunk index blobs.

use std::{env, sync::Arc};

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::StreamExt;
use object_store::{
    aws::{AmazonS3, AmazonS3Builder},
    local, ObjectStore, PutPayload, WriteMultipart,
};
use serde::{Deserialize, Serialize};

use crate::data_model::{ChunkDataName, ChunkIndexData, ChunkIndexDataName};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskStorageConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataStoreConfig {
    pub s3: Option<S3Config>,
    pub disk: Option<DiskStorageConfig>,
}

impl DataStoreConfig {
    pub fn new_disk(path: &str) -> Self {
        DataStoreConfig {
            s3: None,
            disk: Some(DiskStorageConfig {
                path: path.to_string(),
            }),
        }
    }
}

impl Default for DataStoreConfig {
    fn default() -> Self {
        let chunk_store_path = env::current_dir().unwrap().join("volsnap_storage/chunks");
        DataStoreConfig::new_disk(chunk_store_path.to_str().unwrap())
    }
}

fn s3_storage(s3: &S3Config) -> Result<AmazonS3> {
    Ok(AmazonS3Builder::from_env()
        .with_region(s3.region.as_str())
        .with_allow_http(true)
        .with_bucket_name(s3.bucket.clone())
        .build()
        .context("unable to build S3 builder")?)
}

fn file_storage(disk: &DiskStorageConfig) -> Result<local::LocalFileSystem> {
    std::fs::create_dir_all(&disk.path)?;
    let store = local::LocalFileSystem::new_with_prefix(&disk.path)?;
    Ok(store)
}

/// Store of chunk data and chunk index data blobs. Keys are deterministic
/// functions of [`ChunkDataName`] / [`ChunkIndexDataName`], so retried writes
/// overwrite whatever a crashed attempt left behind.
#[derive(Clone)]
pub struct SnapshotDataStore {
    object_store: Arc<dyn ObjectStore>,
}

impl SnapshotDataStore {
    pub fn new(config: DataStoreConfig) -> Result<Self> {
        let object_store: Arc<dyn ObjectStore> = if let Some(s3) = config.s3.as_ref() {
            Arc::new(s3_storage(s3)?)
        } else {
            let disk = config.disk.clone().unwrap_or_else(|| DiskStorageConfig {
                path: "chunks".to_string(),
            });
            Arc::new(file_storage(&disk)?)
        };
        Ok(Self { object_store })
    }

    pub async fn chunk_index_data_exist(&self, name: &ChunkIndexDataName) -> Result<bool> {
        self.exist(&name.object_key()).await
    }

    pub async fn get_chunk_index_data(&self, name: &ChunkIndexDataName) -> Result<ChunkIndexData> {
        let path = object_store::path::Path::from(name.object_key());
        let bytes = self.object_store.get(&path).await?.bytes().await?;
        let index = serde_json::from_slice(&bytes)
            .with_context(|| format!("corrupt chunk index data at {}", name.object_key()))?;
        Ok(index)
    }

    pub async fn put_chunk_index_data(
        &self,
        name: &ChunkIndexDataName,
        data: &ChunkIndexData,
    ) -> Result<()> {
        let path = object_store::path::Path::from(name.object_key());
        let bytes = serde_json::to_vec(data)?;
        self.object_store
            .put(&path, PutPayload::from(bytes))
            .await?;
        Ok(())
    }

    pub async fn delete_chunk_index_data(&self, name: &ChunkIndexDataName) -> Result<()> {
        self.delete(&name.object_key()).await
    }

    pub async fn chunk_data_exist(&self, name: &ChunkDataName) -> Result<bool> {
        self.exist(&name.object_key()).await
    }

    pub async fn delete_chunk_data(&self, name: &ChunkDataName) -> Result<()> {
        self.delete(&name.object_key()).await
    }

    /// Streams one chunk into the store. The key is deterministic, so
    /// whatever a failed upload left behind is overwritten when the chunk is
    /// retried.
    pub async fn put_chunk_data(
        &self,
        name: &ChunkDataName,
        mut data: impl futures::Stream<Item = Result<Bytes>> + Send + Unpin,
    ) -> Result<u64> {
        let path = object_store::path::Path::from(name.object_key());
        let upload = self.object_store.put_multipart(&path).await?;
        let mut writer = WriteMultipart::new(upload);
        let mut size_bytes = 0;
        while let Some(piece) = data.next().await {
            writer.wait_for_capacity(1).await?;
            let piece = piece?;
            size_bytes += piece.len() as u64;
            writer.write(&piece);
        }
        writer.finish().await?;
        Ok(size_bytes)
    }

    async fn exist(&self, key: &str) -> Result<bool> {
        let path = object_store::path::Path::from(key);
        match self.object_store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    // deletes are tolerant of missing keys so that retried cleanup converges
    async fn delete(&self, key: &str) -> Result<()> {
        let path = object_store::path::Path::from(key);
        match self.object_store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
