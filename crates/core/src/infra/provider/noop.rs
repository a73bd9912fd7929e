use std::time::Duration;

use async_trait::async_trait;

use super::{CancelToken, GenerateError, GenerateRequest, ImageGenerator};
use crate::domain::job::ProviderKind;

/// Mock backend: four placeholder images derived from the style id, with an
/// optional artificial latency so cancellation paths can be exercised.
pub struct MockGenerator {
    delay: Duration,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for MockGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageGenerator for MockGenerator {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Mock
    }

    async fn generate(
        &self,
        request: &GenerateRequest,
        mut cancel: CancelToken,
    ) -> Result<Vec<String>, GenerateError> {
        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                reason = cancel.canceled() => return Err(GenerateError::Canceled(reason)),
            }
        }
        if let Some(reason) = cancel.reason() {
            return Err(GenerateError::Canceled(reason));
        }

        let placeholder = format!("/styles/{}/sample.svg", request.style_id);
        Ok(vec![placeholder; 4])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::provider::{cancel_pair, CancelReason};

    fn request() -> GenerateRequest {
        GenerateRequest {
            input_image_url: "data:image/png;base64,abcd".into(),
            style_id: "retro".into(),
            identity_strength: 30,
        }
    }

    #[tokio::test]
    async fn test_returns_four_placeholders() {
        let (_handle, token) = cancel_pair();
        let images = MockGenerator::new().generate(&request(), token).await.unwrap();
        assert_eq!(images.len(), 4);
        assert!(images[0].contains("retro"));
    }

    #[tokio::test]
    async fn test_cancel_aborts_delayed_generation() {
        let (handle, token) = cancel_pair();
        let gen = MockGenerator::with_delay(Duration::from_secs(60));
        handle.cancel(CancelReason::UserRequested);

        let err = gen.generate(&request(), token).await.unwrap_err();
        assert!(matches!(
            err,
            GenerateError::Canceled(CancelReason::UserRequested)
        ));
    }
}
