use garde::Validate;
use serde::Deserialize;

use crate::models::generation::ParamOverrides;
use crate::models::session::NewSession;

/// The maximum number of reference images per request.
pub const MAX_REFERENCE_IMAGES: usize = 4;

/// The request payload for starting a generation.
#[derive(Debug, Deserialize, Validate)]
pub struct GenerationBody {
    #[garde(length(min = 1, max = 256))]
    pub user_id: String,
    #[garde(length(min = 1, max = 256))]
    pub chat_id: String,
    #[garde(length(min = 1, max = 256))]
    pub source_message_id: String,
    #[garde(length(min = 1, max = 256))]
    pub status_card_id: Option<String>,
    #[garde(length(chars, min = 1, max = 4000))]
    pub prompt: String,
    #[serde(default)]
    #[garde(length(max = MAX_REFERENCE_IMAGES), inner(length(min = 1, max = 512)))]
    pub reference_image_ids: Vec<String>,
    #[serde(default)]
    #[garde(skip)]
    pub params: ParamOverrides,
}

impl GenerationBody {
    /// Splits the body into session fields and parameter overrides.
    pub fn into_parts(self) -> (NewSession, ParamOverrides) {
        let fields = NewSession {
            user_id: self.user_id,
            chat_id: self.chat_id,
            source_message_id: self.source_message_id,
            status_card_id: self.status_card_id,
            prompt: self.prompt.trim().to_string(),
            reference_image_ids: self.reference_image_ids,
        };
        (fields, self.params)
    }
}

/// The request payload for answering a credential prompt.
#[derive(Deserialize, Validate)]
pub struct CredentialBody {
    #[garde(length(min = 8, max = 512))]
    pub api_key: String,
}

/// The request payload for storing a credential directly.
#[derive(Deserialize, Validate)]
pub struct StoreCredentialBody {
    #[garde(length(min = 1, max = 256))]
    pub user_id: String,
    #[garde(length(min = 8, max = 512))]
    pub api_key: String,
}
