use async_trait::async_trait;
use gemini_engine::GeneratedImage;
use slack_client::{FileUpload, PostMessage, SlackClient};
use tracing::info;

use crate::error::CuratorError;

/// Delivers a finished message to its destination. Returns the message id.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, message: &PostMessage) -> Result<String, CuratorError>;

    /// Reply to `thread_ts` with an image.
    async fn attach_image(
        &self,
        channel: &str,
        thread_ts: &str,
        image: &GeneratedImage,
        title: &str,
    ) -> Result<(), CuratorError>;
}

#[async_trait]
impl Publisher for SlackClient {
    async fn publish(&self, message: &PostMessage) -> Result<String, CuratorError> {
        let ts = self
            .post_message(message)
            .await
            .map_err(CuratorError::Publish)?;
        info!(channel = %message.channel, ts = %ts, "Message posted");
        Ok(ts)
    }

    async fn attach_image(
        &self,
        channel: &str,
        thread_ts: &str,
        image: &GeneratedImage,
        title: &str,
    ) -> Result<(), CuratorError> {
        let upload = FileUpload {
            channel: channel.to_string(),
            thread_ts: Some(thread_ts.to_string()),
            filename: format!("comic.{}", image.extension()),
            title: title.to_string(),
            initial_comment: None,
            data: image.data.clone(),
        };
        let file_id = self
            .upload_file(&upload)
            .await
            .map_err(CuratorError::Illustration)?;
        info!(channel = %channel, thread_ts = %thread_ts, file_id = %file_id, "Image attached");
        Ok(())
    }
}
