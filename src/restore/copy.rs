use std::sync::Arc;

use async_trait::async_trait;

use super::Restorer;
use crate::checksum::Checksum;
use crate::error::Result;
use crate::storage::LongTermStorage;
use crate::volume::ByteStream;

/// Restores an object by copying the long-term-storage file whose path is
/// the object's id.
#[derive(Debug, Clone)]
pub struct FileCopyRestorer {
    store: Arc<dyn LongTermStorage>,
}

impl FileCopyRestorer {
    pub fn new(store: Arc<dyn LongTermStorage>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Restorer for FileCopyRestorer {
    async fn does_not_exist(&self, id: &str) -> Result<bool> {
        Ok(!self.store.exists(id).await?)
    }

    async fn size_of(&self, id: &str) -> Result<u64> {
        Ok(self.store.size_of(id).await?)
    }

    async fn checksum_of(&self, id: &str) -> Result<Checksum> {
        Ok(self.store.checksum_of(id).await?)
    }

    async fn open_data_object(&self, id: &str) -> Result<ByteStream> {
        Ok(self.store.open_file(id).await?)
    }
}
