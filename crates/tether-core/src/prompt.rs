use serde::{Deserialize, Serialize};

/// Operating mode requested for a turn.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnMode {
    /// The agent must produce a plan and stop once it asks to exit plan mode.
    Plan,
    #[default]
    Agent,
}

impl TurnMode {
    pub fn permission_mode(self) -> PermissionMode {
        match self {
            Self::Plan => PermissionMode::Plan,
            Self::Agent => PermissionMode::BypassPermissions,
        }
    }
}

/// Permission flag handed to the upstream agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    Plan,
    BypassPermissions,
}

impl PermissionMode {
    pub fn as_flag(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::BypassPermissions => "bypassPermissions",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAttachment {
    pub media_type: String,
    /// Base64 payload.
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// What the user typed, plus any attached images.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageAttachment>,
}

impl Prompt {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            images: Vec::new(),
        }
    }

    pub fn with_image(mut self, image: ImageAttachment) -> Self {
        self.images.push(image);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.images.is_empty()
    }

    /// Resolve into what the upstream agent accepts: a bare string when there
    /// are no images, otherwise images first followed by the text block.
    pub fn to_content(&self) -> PromptContent {
        if self.images.is_empty() {
            return PromptContent::Text(self.text.clone());
        }

        let mut blocks: Vec<ContentBlock> = self
            .images
            .iter()
            .map(|img| ContentBlock::Image {
                source: ImageSource {
                    kind: "base64".into(),
                    media_type: img.media_type.clone(),
                    data: img.data.clone(),
                },
            })
            .collect();
        if !self.text.trim().is_empty() {
            blocks.push(ContentBlock::Text {
                text: self.text.clone(),
            });
        }
        PromptContent::Blocks(blocks)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub media_type: String,
    pub data: String,
}
