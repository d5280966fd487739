use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capture::{detect_mime_type, normalize_image_mime, split_data_url, Portrait};
use crate::error::{BoothError, BridgeError};
use crate::llm::{
    compose_transform_prompt, GeneratedImage, TransformTarget, TransformationResult, VisionBackend,
};

pub trait DeviceHost: Send + Sync {
    fn analyze_image(&self, image_base64: &str, callback_id: &str) -> Result<(), String>;

    fn transform_to_era(
        &self,
        image_base64: &str,
        prompt: &str,
        callback_id: &str,
    ) -> Result<(), String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CallKind {
    Analyze,
    Transform,
}

impl CallKind {
    fn prefix(self) -> &'static str {
        match self {
            CallKind::Analyze => "analyze",
            CallKind::Transform => "transform",
        }
    }
}

struct PendingCall {
    kind: CallKind,
    sender: oneshot::Sender<String>,
}

type PendingMap = Arc<Mutex<HashMap<String, PendingCall>>>;

#[derive(Clone)]
pub struct BridgeCallbacks {
    pending: PendingMap,
}

impl BridgeCallbacks {
    pub fn deliver(&self, callback_id: &str, result: String) -> bool {
        let Some(call) = self.pending.lock().remove(callback_id) else {
            debug!("Dropping bridge result for unknown callback {callback_id}");
            return false;
        };
        call.sender.send(result).is_ok()
    }

    pub fn on_analysis_result(&self, callback_id: &str, result: String) -> bool {
        self.deliver(callback_id, result)
    }

    pub fn on_transformation_result(&self, callback_id: &str, result: String) -> bool {
        self.deliver(callback_id, result)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

pub struct BridgeClient {
    host: Arc<dyn DeviceHost>,
    pending: PendingMap,
    timeout: Duration,
}

impl BridgeClient {
    pub fn new(host: Arc<dyn DeviceHost>, timeout: Duration) -> Self {
        Self {
            host,
            pending: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    pub fn callbacks(&self) -> BridgeCallbacks {
        BridgeCallbacks {
            pending: self.pending.clone(),
        }
    }

    fn register(&self, kind: CallKind) -> (String, oneshot::Receiver<String>) {
        let callback_id = format!("{}_{}", kind.prefix(), Uuid::new_v4().simple());
        let (sender, receiver) = oneshot::channel();
        let mut pending = self.pending.lock();
        let superseded: Vec<String> = pending
            .iter()
            .filter(|(_, call)| call.kind == kind)
            .map(|(id, _)| id.clone())
            .collect();
        for id in superseded {
            pending.remove(&id);
            info!("Bridge call {id} superseded by {callback_id}");
        }
        pending.insert(callback_id.clone(), PendingCall { kind, sender });
        (callback_id, receiver)
    }

    async fn call<F>(&self, kind: CallKind, invoke: F) -> Result<String, BridgeError>
    where
        F: FnOnce(&dyn DeviceHost, &str) -> Result<(), String>,
    {
        // the slot must exist before the host runs: it may answer synchronously
        let (callback_id, receiver) = self.register(kind);

        if let Err(err) = invoke(self.host.as_ref(), &callback_id) {
            self.pending.lock().remove(&callback_id);
            warn!("Bridge call {callback_id} failed: {err}");
            return Err(BridgeError::Host(err));
        }

        match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(BridgeError::Superseded(callback_id)),
            Err(_) => {
                self.pending.lock().remove(&callback_id);
                Err(BridgeError::TimedOut(callback_id, self.timeout.as_secs()))
            }
        }
    }
}

fn parse_transform_result(raw: &str) -> TransformationResult {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return TransformationResult::default();
    }

    let (declared_mime, payload) = split_data_url(trimmed);
    let looks_like_image = declared_mime.map_or(true, |mime| mime.starts_with("image/"));
    if looks_like_image && !payload.contains(char::is_whitespace) {
        if let Ok(bytes) = general_purpose::STANDARD.decode(payload) {
            let detected = detect_mime_type(&bytes).filter(|mime| mime.starts_with("image/"));
            if let Some(mime) = declared_mime.map(str::to_string).or(detected) {
                return TransformationResult {
                    image: Some(GeneratedImage {
                        bytes,
                        mime_type: normalize_image_mime(&mime),
                    }),
                    text: None,
                };
            }
        }
    }

    TransformationResult {
        image: None,
        text: Some(trimmed.to_string()),
    }
}

#[async_trait]
impl VisionBackend for BridgeClient {
    fn name(&self) -> &'static str {
        "device-bridge"
    }

    async fn analyze(&self, portrait: &Portrait) -> Result<String, BoothError> {
        let image = portrait.to_base64();
        let result = self
            .call(CallKind::Analyze, |host, callback_id| {
                host.analyze_image(&image, callback_id)
            })
            .await?;
        let text = result.trim();
        if text.is_empty() {
            return Err(BoothError::Analysis("bridge returned no analysis".to_string()));
        }
        Ok(text.to_string())
    }

    async fn transform(
        &self,
        portrait: &Portrait,
        target: &TransformTarget,
        analysis: Option<&str>,
    ) -> Result<TransformationResult, BoothError> {
        let image = portrait.to_base64();
        let prompt = compose_transform_prompt(target, analysis);
        let raw = self
            .call(CallKind::Transform, |host, callback_id| {
                host.transform_to_era(&image, &prompt, callback_id)
            })
            .await?;
        let result = parse_transform_result(&raw);
        if result.is_empty() {
            return Err(BoothError::Transform("bridge returned an empty result".to_string()));
        }
        Ok(result)
    }
}
