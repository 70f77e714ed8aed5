//! Self-update orchestration.
//!
//! Updating replaces the backend's own container, so the backend goes away
//! mid-flight. The flow is: optionally pull the new image over a pull
//! session, then poll the liveness endpoint over plain HTTP until the new
//! backend answers. Progress text is streamed to the caller line by line.

use std::time::Duration;

use log::debug;
use tokio::sync::mpsc;

use crate::config::ClientConfig;
use crate::session::pull::{pull_image, PullError};

/// Delay between liveness probes.
pub const LIVENESS_INTERVAL: Duration = Duration::from_secs(2);
/// Probe attempts before the update is declared failed.
pub const LIVENESS_ATTEMPTS: u32 = 10;

/// Why a self-update failed.
#[derive(Debug)]
pub enum UpdateError {
    /// Pulling the new image failed.
    Pull(PullError),
    /// The backend never came back; the caller must troubleshoot server-side.
    Fatal(String),
}

impl std::fmt::Display for UpdateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pull(e) => write!(f, "update pull failed: {e}"),
            Self::Fatal(msg) => write!(f, "update failed: {msg}"),
        }
    }
}

impl std::error::Error for UpdateError {}

impl From<PullError> for UpdateError {
    fn from(e: PullError) -> Self {
        Self::Pull(e)
    }
}

/// Poll the liveness endpoint until the backend answers.
///
/// Waits one interval before the first probe; the old backend is usually
/// still shutting down when this is called.
pub async fn wait_live(
    config: &ClientConfig,
    progress: mpsc::UnboundedSender<String>,
) -> Result<(), UpdateError> {
    wait_live_with(config, LIVENESS_INTERVAL, progress).await
}

async fn wait_live_with(
    config: &ClientConfig,
    interval: Duration,
    progress: mpsc::UnboundedSender<String>,
) -> Result<(), UpdateError> {
    let client = reqwest::Client::new();
    let url = config.ping_url();

    for attempt in 1..=LIVENESS_ATTEMPTS {
        tokio::time::sleep(interval).await;
        let _ = progress.send("Try to ping the backend...\r\n".to_string());

        let mut request = client.get(&url);
        if !config.token.is_empty() {
            request = request.bearer_auth(&config.token);
        }
        match request.send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!("backend live again after {attempt} probes");
                let _ = progress.send("The backend is live now.\r\n".to_string());
                return Ok(());
            }
            Ok(resp) => {
                let _ = progress.send(format!(
                    "The backend is not live yet. ({})\r\n",
                    resp.status().as_u16()
                ));
            }
            Err(_) => {
                let _ = progress.send("The backend is not live yet.\r\n".to_string());
            }
        }
    }

    Err(UpdateError::Fatal(format!(
        "the backend is still not alive after {LIVENESS_ATTEMPTS} retries, \
         troubleshooting on the server is required"
    )))
}

/// Pull the new image (unless `skip_pull`) and wait for the restarted
/// backend to come back.
pub async fn update_image(
    config: &ClientConfig,
    image: &str,
    skip_pull: bool,
    progress: mpsc::UnboundedSender<String>,
) -> Result<(), UpdateError> {
    if skip_pull {
        let _ = progress.send("Image pull skipped.\r\n".to_string());
    } else {
        let pull_progress = progress.clone();
        pull_image(config, image, move |text| {
            let _ = pull_progress.send(text);
        })
        .await?;
        let _ = progress.send("Image pulled successfully.\r\n".to_string());
    }

    wait_live(config, progress).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_wait_live_resolves_when_backend_answers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/ping"))
            .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
            .mount(&server)
            .await;

        let config = ClientConfig::new(server.uri(), "token");
        let (tx, mut rx) = mpsc::unbounded_channel();
        wait_live_with(&config, Duration::from_millis(5), tx)
            .await
            .expect("live");

        let first = rx.recv().await.expect("progress");
        assert!(first.contains("Try to ping"), "{first}");
    }

    #[tokio::test]
    async fn test_wait_live_gives_up_after_ten_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/ping"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let config = ClientConfig::new(server.uri(), "token");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let err = wait_live_with(&config, Duration::from_millis(1), tx)
            .await
            .err()
            .expect("must fail");
        assert!(matches!(err, UpdateError::Fatal(_)));

        // One probe announcement and one failure report per attempt.
        let mut probes = 0;
        while let Ok(line) = rx.try_recv() {
            if line.contains("Try to ping") {
                probes += 1;
            }
        }
        assert_eq!(probes, LIVENESS_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_update_with_skip_pull_only_waits_for_liveness() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/ping"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let config = ClientConfig::new(server.uri(), "token");
        let (tx, mut rx) = mpsc::unbounded_channel();

        // LIVENESS_INTERVAL is two seconds; tolerated here since the first
        // probe already succeeds.
        update_image(&config, "ghcr.io/x/y:latest", true, tx)
            .await
            .expect("update");
        let first = rx.recv().await.expect("progress");
        assert!(first.contains("skipped"), "{first}");
    }
}
