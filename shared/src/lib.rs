use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

/// The super-resolution network topologies the service can run.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ArchitectureKind {
    /// Enhanced residual network with a sub-pixel tail.
    #[default]
    Enhanced,
    /// Adversarial-style generator with batch-normalized residual blocks.
    Srgan,
    /// Multi-branch network tuned for radiographs.
    Medical,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UploadResponse {
    pub success: bool,
    pub original_image: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EnhanceRequest {
    pub filename: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EnhanceResponse {
    pub success: bool,
    pub improved_image: String,
    /// True when the model was unavailable and the original was copied as-is.
    pub fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ModelStatusResponse {
    pub success: bool,
    pub ready: bool,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<ArchitectureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale_factor: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}
