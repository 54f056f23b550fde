use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct SendMessageResp {
    #[serde(default)]
    pub messages: Vec<SentMessage>,
}

#[derive(Deserialize, Debug)]
pub struct SentMessage {
    pub id: String,
}

#[derive(Deserialize, Debug)]
pub struct ErrorEnvelope {
    pub error: ProviderError,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ProviderError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub error_subcode: Option<i64>,
    #[serde(default)]
    pub fbtrace_id: Option<String>,
}
