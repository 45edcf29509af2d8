use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::{AggregateInsight, Analyzer, SessionInsight, aggregate_schema, session_schema};
use crate::cache::RenderedSession;
use crate::config::InferenceConfig;
use crate::rollup::{SessionAnalysis, UserRollup};
use crate::source::Recording;
use crate::utils::http_client::build_client;
use crate::{Error, Result};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InferenceRequest<'a, I: Serialize> {
    model: &'a str,
    task: &'static str,
    input: I,
    schema: serde_json::Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionInput<'a> {
    recording: &'a Recording,
    video_uri: &'a str,
    video_duration: f64,
    events_uri: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UserInput<'a> {
    email: &'a str,
    sessions: &'a [SessionAnalysis],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GroupInput<'a> {
    group_id: &'a str,
    users: &'a [UserRollup],
}

/// Posts structured input plus an output schema to an inference endpoint.
///
/// The reply is either the structured object itself or an envelope with the
/// object under `output`.
pub struct HttpAnalyzer {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpAnalyzer {
    pub fn new(config: &InferenceConfig) -> Result<Self> {
        url::Url::parse(&config.endpoint).map_err(|e| {
            Error::config(format!("invalid inference endpoint {:?}: {e}", config.endpoint))
        })?;
        Ok(Self {
            client: build_client(Duration::from_secs(config.request_timeout_secs))?,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }

    async fn call<I: Serialize + Send, O: DeserializeOwned>(
        &self,
        task: &'static str,
        input: I,
        schema: serde_json::Value,
    ) -> Result<O> {
        let body = InferenceRequest {
            model: &self.model,
            task,
            input,
            schema,
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Inference(format!("{task} request failed: {e}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            warn!("Inference failed: {} - {}", status, text);
            return Err(Error::Inference(format!("{task}: {status} - {text}")));
        }

        let mut reply: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Inference(format!("{task}: unreadable reply: {e}")))?;
        if let Some(output) = reply.get_mut("output").map(serde_json::Value::take) {
            reply = output;
        }
        debug!(task, "Inference reply received");
        serde_json::from_value(reply)
            .map_err(|e| Error::Inference(format!("{task}: reply does not match schema: {e}")))
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    async fn analyze_session(
        &self,
        recording: &Recording,
        rendered: &RenderedSession,
    ) -> Result<SessionInsight> {
        let input = SessionInput {
            recording,
            video_uri: &rendered.video_uri,
            video_duration: rendered.video_duration,
            events_uri: &rendered.events_uri,
        };
        self.call("session", input, session_schema()).await
    }

    async fn summarize_user(
        &self,
        email: &str,
        analyses: &[SessionAnalysis],
    ) -> Result<AggregateInsight> {
        let input = UserInput {
            email,
            sessions: analyses,
        };
        self.call("user", input, aggregate_schema()).await
    }

    async fn summarize_group(
        &self,
        group_id: &str,
        users: &[UserRollup],
    ) -> Result<AggregateInsight> {
        let input = GroupInput { group_id, users };
        self.call("group", input, aggregate_schema()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn analyzer(endpoint: String) -> HttpAnalyzer {
        HttpAnalyzer::new(&InferenceConfig {
            endpoint,
            model: "m".to_string(),
            api_key: None,
            request_timeout_secs: 5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_unwraps_output_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/analyze"))
            .and(body_partial_json(serde_json::json!({"task": "group", "model": "m"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "output": {"story": "steady", "health": "healthy", "score": 80}
            })))
            .mount(&server)
            .await;

        let users = vec![UserRollup {
            email: "a@b.co".to_string(),
            group_id: Some("g".to_string()),
            analysis_hash: "h".to_string(),
            session_ids: vec!["s1".to_string()],
            insight: AggregateInsight {
                story: "ok".to_string(),
                health: "healthy".to_string(),
                score: 70.0,
            },
            updated_at: chrono::Utc::now(),
        }];
        let insight = analyzer(format!("{}/analyze", server.uri()))
            .summarize_group("g", &users)
            .await
            .unwrap();
        assert_eq!(insight.story, "steady");
        assert_eq!(insight.score, 80.0);
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_inference_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"nope": 1})))
            .mount(&server)
            .await;

        let err = analyzer(server.uri())
            .summarize_user("a@b.co", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Inference(_)));
    }
}
