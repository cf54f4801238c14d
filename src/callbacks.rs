use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::proxy::EventCallback;
use crate::session::events::{EventType, SessionEvent};

/// Maximum concurrent callback deliveries
const MAX_CONCURRENT_DELIVERIES: usize = 100;

/// Delivers event callbacks as HTTP POSTs, fire and forget.
#[derive(Clone)]
pub struct CallbackDispatcher {
    client: reqwest::Client,
    secret: Option<String>,
    semaphore: Arc<Semaphore>,
}

impl CallbackDispatcher {
    /// With a `secret`, each body is signed in an `X-Signature-256` header.
    pub fn new(secret: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            secret: secret.filter(|s| !s.is_empty()),
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_DELIVERIES)),
        }
    }

    /// Callback posting every message event whose data contains `find` to `url`.
    pub fn substring_callback(&self, url: String, find: Vec<u8>) -> EventCallback {
        let dispatcher = self.clone();
        EventCallback::new([EventType::NewMessage], move |event| {
            if contains(&event.data, &find) {
                dispatcher.post(&url, event);
            }
        })
    }

    /// Queue a POST of `event` to `url`. Delivery failures are logged only.
    pub fn post(&self, url: &str, event: &SessionEvent) {
        let body = event.to_json();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(url = %url, "No runtime for callback delivery");
            return;
        };
        let client = self.client.clone();
        let secret = self.secret.clone();
        let semaphore = self.semaphore.clone();
        let url = url.to_string();
        runtime.spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else {
                return;
            };
            match send_callback(&client, &url, secret.as_deref(), body).await {
                Ok(()) => debug!(url = %url, "Callback delivered"),
                Err(e) => warn!(url = %url, error = %e, "Callback delivery failed"),
            }
        });
    }
}

/// Signature header value for `body`: `sha256=<hex hmac>`.
pub fn signature(secret: &str, body: &[u8]) -> anyhow::Result<String> {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

async fn send_callback(
    client: &reqwest::Client,
    url: &str,
    secret: Option<&str>,
    body: String,
) -> anyhow::Result<()> {
    let mut request = client.post(url).header("Content-Type", "application/json");
    if let Some(secret) = secret {
        request = request.header("X-Signature-256", signature(secret, body.as_bytes())?);
    }

    let response = request.body(body).send().await?;
    if !response.status().is_success() {
        anyhow::bail!("callback returned status {}", response.status());
    }
    Ok(())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}
