pub mod bridge;
pub mod gemini;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};

use crate::capture::Portrait;
use crate::config::TRANSFORM_INSTRUCTION;
use crate::era::Era;
use crate::error::BoothError;

pub use bridge::{BridgeCallbacks, BridgeClient, DeviceHost};
pub use gemini::GeminiClient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformTarget {
    Era(&'static Era),
    Custom(String),
}

impl TransformTarget {
    pub fn label(&self) -> &str {
        match self {
            TransformTarget::Era(era) => era.name,
            TransformTarget::Custom(prompt) => prompt,
        }
    }

    pub fn file_slug(&self) -> &str {
        match self {
            TransformTarget::Era(era) => era.id,
            TransformTarget::Custom(_) => "edit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl GeneratedImage {
    pub fn to_data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.mime_type,
            general_purpose::STANDARD.encode(&self.bytes)
        )
    }
}

pub fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/heic" => "heic",
        _ => "png",
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformationResult {
    pub image: Option<GeneratedImage>,
    pub text: Option<String>,
}

impl TransformationResult {
    pub fn is_empty(&self) -> bool {
        self.image.is_none() && self.text.is_none()
    }
}

pub fn compose_transform_prompt(target: &TransformTarget, analysis: Option<&str>) -> String {
    let mut prompt = match target {
        TransformTarget::Era(era) => format!(
            "Transform the person in this portrait into a {} scene. Style guidance: {}",
            era.name, era.description
        ),
        TransformTarget::Custom(custom) => format!("Transform this portrait: {}", custom.trim()),
    };
    prompt.push_str("\n\n");
    prompt.push_str(TRANSFORM_INSTRUCTION);

    if let Some(analysis) = analysis.map(str::trim).filter(|text| !text.is_empty()) {
        prompt.push_str("\n\nIdentity analysis:\n");
        prompt.push_str(analysis);
    }
    prompt
}

#[async_trait]
pub trait VisionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn analyze(&self, portrait: &Portrait) -> Result<String, BoothError>;

    async fn transform(
        &self,
        portrait: &Portrait,
        target: &TransformTarget,
        analysis: Option<&str>,
    ) -> Result<TransformationResult, BoothError>;
}
