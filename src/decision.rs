use crate::error::LoopError;
use crate::instruction::RawResponse;
use crate::orchestrator::RunId;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct DecisionConfig {
    pub base_url: String, // e.g. "http://10.0.2.2:5000"
    pub timeout: Duration,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5000".into(),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Remote service that turns evidence into the next [`crate::Instruction`].
///
/// Both calls are fire-once: implementations must not retry. Every failure is
/// reported as [`LoopError::NetworkFailure`].
#[async_trait]
pub trait DecisionService: Send + Sync {
    async fn send_init(
        &self,
        run_id: &RunId,
        audio: Option<&Path>,
        screenshot: Option<&Path>,
    ) -> Result<RawResponse, LoopError>;

    async fn send_feedback(
        &self,
        run_id: &RunId,
        screenshot: Option<&Path>,
    ) -> Result<RawResponse, LoopError>;
}

#[derive(Clone)]
pub struct HttpDecisionClient {
    http: Client,
    cfg: DecisionConfig,
}

impl HttpDecisionClient {
    pub fn new(cfg: DecisionConfig) -> Result<Self, LoopError> {
        let http = Client::builder()
            .connect_timeout(cfg.timeout)
            .timeout(cfg.timeout)
            .build()?;
        Ok(Self { http, cfg })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.cfg.base_url.trim_end_matches('/'), endpoint)
    }

    /// `GET /health`. Ok(false) means the server answered with a non-2xx status.
    pub async fn health(&self) -> Result<bool, LoopError> {
        let resp = self.http.get(self.url("/health")).send().await?;
        Ok(resp.status().is_success())
    }

    async fn submit(&self, endpoint: &str, run_id: &RunId, form: Form) -> Result<RawResponse, LoopError> {
        let url = self.url(endpoint);
        info!(run_id = %run_id, %url, "submitting decision request");
        let resp = self.http.post(&url).multipart(form).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            warn!(run_id = %run_id, %status, "decision request rejected");
            return Err(LoopError::NetworkFailure(format!("{} {}: {}", url, status, text)));
        }
        debug!(run_id = %run_id, body = %text, "decision response");
        Ok(RawResponse(text))
    }
}

#[async_trait]
impl DecisionService for HttpDecisionClient {
    async fn send_init(
        &self,
        run_id: &RunId,
        audio: Option<&Path>,
        screenshot: Option<&Path>,
    ) -> Result<RawResponse, LoopError> {
        let mut form = Form::new().text("thread_id", run_id.to_string());
        form = attach(form, "audio", audio, "audio/m4a").await;
        form = attach(form, "image", screenshot, "image/png").await;
        self.submit("/decision/init", run_id, form).await
    }

    async fn send_feedback(
        &self,
        run_id: &RunId,
        screenshot: Option<&Path>,
    ) -> Result<RawResponse, LoopError> {
        let form = Form::new().text("thread_id", run_id.to_string());
        let form = attach(form, "image", screenshot, "image/png").await;
        self.submit("/decision/feedback", run_id, form).await
    }
}

/// Add a file part when the file is readable and non-empty; otherwise leave
/// the field out and keep going.
async fn attach(form: Form, field: &'static str, path: Option<&Path>, mime: &str) -> Form {
    let Some(path) = path else {
        return form;
    };
    let bytes = match tokio::fs::read(path).await {
        Ok(b) if !b.is_empty() => b,
        Ok(_) => {
            warn!(field, path = %path.display(), "artifact empty, omitted");
            return form;
        }
        Err(e) => {
            warn!(field, path = %path.display(), "artifact unreadable, omitted: {}", e);
            return form;
        }
    };
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| field.to_string());
    debug!(field, file = %name, size = bytes.len(), "attaching artifact");
    match Part::bytes(bytes).file_name(name).mime_str(mime) {
        Ok(part) => form.part(field, part),
        Err(e) => {
            warn!(field, "bad mime {}: {}", mime, e);
            form
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn client(server: &MockServer) -> HttpDecisionClient {
        HttpDecisionClient::new(DecisionConfig {
            base_url: server.base_url(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn init_submits_thread_id_and_artifacts() {
        let server = MockServer::start_async().await;
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("audio_r1.m4a");
        let image = dir.path().join("screenshot_r1_0.png");
        std::fs::write(&audio, b"AUDIOBYTES").unwrap();
        std::fs::write(&image, b"PNGBYTES").unwrap();

        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/decision/init")
                    .body_includes("name=\"thread_id\"")
                    .body_includes("r1")
                    .body_includes("AUDIOBYTES")
                    .body_includes("PNGBYTES");
                then.status(200).body("action_type:click,x:1,y:2,radiu:3");
            })
            .await;

        let resp = client(&server)
            .send_init(&RunId::from("r1"), Some(&audio), Some(&image))
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(resp, RawResponse("action_type:click,x:1,y:2,radiu:3".into()));
    }

    #[tokio::test]
    async fn missing_artifact_is_omitted_not_fatal() {
        let server = MockServer::start_async().await;
        let dir = tempfile::tempdir().unwrap();
        let absent = dir.path().join("nope.png");

        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/decision/feedback")
                    .body_includes("name=\"thread_id\"");
                then.status(200).body("action_type:end");
            })
            .await;

        let resp = client(&server)
            .send_feedback(&RunId::from("r2"), Some(&absent))
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(resp.0, "action_type:end");
    }

    #[tokio::test]
    async fn non_2xx_is_network_failure() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/decision/feedback");
                then.status(502).body("bad gateway");
            })
            .await;

        let err = client(&server)
            .send_feedback(&RunId::from("r3"), None)
            .await
            .unwrap_err();
        match err {
            LoopError::NetworkFailure(reason) => assert!(reason.contains("502")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_server_is_network_failure() {
        let c = HttpDecisionClient::new(DecisionConfig {
            base_url: "http://127.0.0.1:9".into(),
            timeout: Duration::from_secs(2),
        })
        .unwrap();
        let err = c.send_init(&RunId::from("r4"), None, None).await.unwrap_err();
        assert!(matches!(err, LoopError::NetworkFailure(_)));
    }

    #[tokio::test]
    async fn health_reports_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(200);
            })
            .await;
        assert!(client(&server).health().await.unwrap());
    }
}
