//! Concrete invokers, notifiers and ecology sources used by `ov-control`.

use crate::config::{EcologyConfig, InvokerConfig};
use async_trait::async_trait;
use overseer_core::{
    CollaboratorError, CollaboratorResult, EcologySource, Invocation, Invoker, Labourer, Notifier,
};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Posts each invocation as JSON to the labourer's `arn`, which must be an
/// HTTP endpoint. Only acceptance is awaited, not the task itself.
pub struct HttpInvoker {
    client: reqwest::Client,
}

impl HttpInvoker {
    pub fn new(config: &InvokerConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(HttpInvoker { client })
    }
}

#[async_trait]
impl Invoker for HttpInvoker {
    async fn invoke(&self, labourer: &Labourer, invocation: &Invocation) -> CollaboratorResult<()> {
        let url = labourer.arn.as_deref().ok_or_else(|| {
            CollaboratorError::Invocation(format!("labourer {} has no arn", labourer.id))
        })?;

        self.client
            .post(url)
            .json(invocation)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| CollaboratorError::Invocation(e.to_string()))?;

        debug!("Posted task {} to {}", invocation.task_id, url);
        Ok(())
    }
}

/// Writes notifications to the log.
#[derive(Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &str, subject: &str) -> CollaboratorResult<()> {
        info!(subject = subject, "{}", message);
        Ok(())
    }
}

/// Posts `{"subject", "message"}` to a webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        WebhookNotifier {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, message: &str, subject: &str) -> CollaboratorResult<()> {
        self.client
            .post(&self.url)
            .json(&json!({ "subject": subject, "message": message }))
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| CollaboratorError::Notification(e.to_string()))?;
        Ok(())
    }
}

/// Health scores taken from configuration.
pub struct StaticEcology {
    default_health: u8,
    health: HashMap<String, u8>,
}

impl StaticEcology {
    pub fn new(config: &EcologyConfig) -> Self {
        StaticEcology {
            default_health: config.default_health,
            health: config.health.clone(),
        }
    }
}

#[async_trait]
impl EcologySource for StaticEcology {
    async fn get_labourer_status(&self, labourer: &Labourer) -> CollaboratorResult<u8> {
        let health = self
            .health
            .get(&labourer.id)
            .copied()
            .unwrap_or(self.default_health);
        if health > 4 {
            return Err(CollaboratorError::Ecology(format!(
                "health {} of labourer {} is outside 0..=4",
                health, labourer.id
            )));
        }
        Ok(health)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_core::LabourerAttributes;

    fn labourer(id: &str) -> Labourer {
        Labourer::new(id, LabourerAttributes::default()).unwrap()
    }

    #[tokio::test]
    async fn test_static_ecology_health() {
        let mut config = EcologyConfig::default();
        config.health.insert("sick".to_string(), 1);
        config.health.insert("broken".to_string(), 9);
        let ecology = StaticEcology::new(&config);

        assert_eq!(ecology.get_labourer_status(&labourer("sick")).await.unwrap(), 1);
        assert_eq!(ecology.get_labourer_status(&labourer("anyone")).await.unwrap(), 4);
        assert!(ecology.get_labourer_status(&labourer("broken")).await.is_err());
        assert_eq!(ecology.get_average_duration(&labourer("sick")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_http_invoker_requires_arn() {
        let invoker = HttpInvoker::new(&InvokerConfig::default()).unwrap();
        let invocation = Invocation {
            task_id: "t1".to_string(),
            labourer_id: "lab".to_string(),
            attempt: 1,
            payload: json!({}),
        };

        let result = invoker.invoke(&labourer("lab"), &invocation).await;
        assert!(matches!(result, Err(CollaboratorError::Invocation(_))));
    }

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        LogNotifier.send("task t1 gave up", "Task archived").await.unwrap();
    }
}
