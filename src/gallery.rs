use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine as _};
use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::capture::{detect_mime_type, split_data_url};
use crate::db::storage::LocalStorage;
use crate::error::BoothError;
use crate::llm::extension_for_mime;

pub const GALLERY_KEY: &str = "chronos_saved_portraits";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedPortrait {
    pub id: String,
    pub data: String,
    pub date: String,
}

#[derive(Clone)]
pub struct Gallery {
    storage: LocalStorage,
    capacity: usize,
}

fn decode_list(raw: Option<String>) -> Vec<SavedPortrait> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    match serde_json::from_str(&raw) {
        Ok(list) => list,
        Err(err) => {
            warn!("Failed to parse saved portraits, starting from an empty gallery: {err}");
            Vec::new()
        }
    }
}

impl Gallery {
    pub fn new(storage: LocalStorage, capacity: usize) -> Self {
        Self {
            storage,
            capacity: capacity.max(1),
        }
    }

    pub async fn health_check(&self) -> Result<(), BoothError> {
        self.storage.health_check().await
    }

    pub async fn list(&self) -> Result<Vec<SavedPortrait>, BoothError> {
        Ok(decode_list(self.storage.get(GALLERY_KEY).await?))
    }

    pub async fn get(&self, id: &str) -> Result<Option<SavedPortrait>, BoothError> {
        Ok(self.list().await?.into_iter().find(|entry| entry.id == id))
    }

    pub async fn save(&self, data: String) -> Result<SavedPortrait, BoothError> {
        let entry = SavedPortrait {
            id: Uuid::new_v4().to_string(),
            data,
            date: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        };
        let capacity = self.capacity;
        let saved = entry.clone();
        let evicted = self
            .storage
            .update(GALLERY_KEY, move |raw| {
                let mut list = decode_list(raw);
                list.insert(0, entry);
                let evicted = list.len().saturating_sub(capacity);
                list.truncate(capacity);
                Ok((Some(serde_json::to_string(&list)?), evicted))
            })
            .await?;
        info!("Saved portrait {} (evicted {})", saved.id, evicted);
        Ok(saved)
    }

    pub async fn delete(&self, id: &str) -> Result<bool, BoothError> {
        let removed = self
            .storage
            .update(GALLERY_KEY, |raw| {
                let mut list = decode_list(raw);
                let before = list.len();
                list.retain(|entry| entry.id != id);
                if list.len() == before {
                    return Ok((None, false));
                }
                Ok((Some(serde_json::to_string(&list)?), true))
            })
            .await?;
        if removed {
            info!("Deleted saved portrait {id}");
        }
        Ok(removed)
    }

    pub async fn export(&self, id: &str, dir: &Path) -> Result<PathBuf, BoothError> {
        let entry = self
            .get(id)
            .await?
            .ok_or_else(|| BoothError::Storage(format!("no saved portrait with id {id}")))?;
        let (declared_mime, payload) = split_data_url(&entry.data);
        let bytes = general_purpose::STANDARD
            .decode(payload)
            .map_err(|err| BoothError::Storage(format!("saved portrait {id} is corrupt: {err}")))?;
        let mime = declared_mime
            .map(str::to_string)
            .or_else(|| detect_mime_type(&bytes))
            .unwrap_or_else(|| "image/png".to_string());
        write_image_file(dir, &format!("chronos-booth-{id}"), &bytes, &mime).await
    }
}

pub async fn write_image_file(
    dir: &Path,
    stem: &str,
    bytes: &[u8],
    mime_type: &str,
) -> Result<PathBuf, BoothError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|err| BoothError::Storage(format!("failed to create {}: {err}", dir.display())))?;
    let path = dir.join(format!("{stem}.{}", extension_for_mime(mime_type)));
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|err| BoothError::Storage(format!("failed to write {}: {err}", path.display())))?;
    Ok(path)
}
