//! [`Classifier`] backed by a Hugging Face style text-classification endpoint:
//! `POST {endpoint}/{model}` with `{"inputs": "..."}` answering `[[{"label", "score"}, ...]]`.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use serde::{Deserialize, Serialize};

use super::{Classifier, Prediction};
use crate::Error;
use crate::config::SentimentConfig;
use crate::message::SentimentLabel;

#[derive(Serialize)]
struct InferenceRequest<'a> {
    inputs: &'a str,
}

#[derive(Deserialize, Debug, Clone)]
struct LabelScore {
    label: String,
    score: f64,
}

/// Single inputs come back either nested once per input or flat.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum InferenceResponse {
    Nested(Vec<Vec<LabelScore>>),
    Flat(Vec<LabelScore>),
}

impl InferenceResponse {
    fn best(self) -> crate::Result<Prediction> {
        let scores = match self {
            InferenceResponse::Nested(outer) => outer.into_iter().next().unwrap_or_default(),
            InferenceResponse::Flat(scores) => scores,
        };
        let best = scores
            .into_iter()
            .filter(|s| s.score.is_finite())
            .max_by(|a, b| a.score.total_cmp(&b.score))
            .ok_or_else(|| Error::Scoring("model returned no prediction".to_string()))?;
        Ok(Prediction {
            label: best.label.parse::<SentimentLabel>()?,
            confidence: best.score,
        })
    }
}

#[derive(Clone)]
pub struct HttpClassifier {
    client: Client,
    url: String,
    api_token: Option<String>,
}

impl HttpClassifier {
    pub fn new(config: &SentimentConfig) -> crate::Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("Creating sentiment model client: {e}")))?;
        Ok(Self {
            client,
            url: config.model_url(),
            api_token: config.api_token.clone(),
        })
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, text: &str) -> crate::Result<Prediction> {
        let mut request = self
            .client
            .post(&self.url)
            .header(header::ACCEPT, "application/json")
            .json(&InferenceRequest { inputs: text });
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::ModelUnavailable(format!("Calling {}: {e}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("{} returned {status}: {body}", self.url);
            // 503 is also what the inference API answers while the model is loading
            return Err(
                if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                    Error::ModelUnavailable(message)
                } else {
                    Error::Scoring(message)
                },
            );
        }

        response
            .json::<InferenceResponse>()
            .await
            .map_err(|e| Error::Scoring(format!("Decoding model response: {e}")))?
            .best()
    }
}
