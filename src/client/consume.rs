use std::future::Future;
use std::sync::PoisonError;
use std::sync::atomic::Ordering;

use futures_util::StreamExt;
use tokio::sync::oneshot;

use crate::transport::DeliveryStream;
use crate::utils::error::{MqError, Result};
use crate::utils::logging::{Field, LogContext};

use super::MqClient;

impl MqClient {
    /// Stream this consumer's queue to `handler` on its own task.
    ///
    /// Deliveries are not acknowledged automatically. The stream ends when
    /// the client shuts down. The handler reports its outcome by sending
    /// once on the completion slot; [`close`](MqClient::close) waits for it.
    ///
    /// If the broker closes the channel, the whole client is cancelled:
    /// pending publishes fail with [`MqError::Cancelled`] and the stream ends.
    pub async fn consume<H, Fut>(&self, ctx: &LogContext, handler: H) -> Result<()>
    where
        H: FnOnce(DeliveryStream, oneshot::Sender<Result<()>>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(queue) = self.queue_name() else {
            return Err(MqError::Consume(
                "client has no device queue; build it with MqClient::consumer".to_string(),
            ));
        };
        if self.shutdown.is_triggered() {
            return Err(MqError::Cancelled);
        }
        let channel = self.channel().ok_or(MqError::NotConnected)?;
        if self.consuming.swap(true, Ordering::AcqRel) {
            return Err(MqError::Consume("already consuming".to_string()));
        }

        let closed = channel.notify_close();
        let consumer_tag = format!("{}-{}", queue, self.ctx.correlation_id());
        let deliveries = match channel.consume(queue, &consumer_tag).await {
            Ok(deliveries) => deliveries,
            Err(err) => {
                self.log.error(
                    ctx,
                    "consume failed",
                    &[Field::new("queue", queue), Field::new("error", &err)],
                );
                let _ = self.close().await;
                return Err(err);
            }
        };
        self.log.info(
            ctx,
            "consuming",
            &[
                Field::new("queue", queue),
                Field::new("consumer_tag", &consumer_tag),
            ],
        );

        let watcher = {
            let shutdown = self.shutdown.clone();
            let log = self.log.clone();
            let ctx = ctx.clone();
            let queue = queue.to_string();
            async move {
                tokio::select! {
                    reason = closed => {
                        match reason {
                            Ok(err) => log.error(
                                &ctx,
                                "channel closed by broker",
                                &[Field::new("queue", &queue), Field::new("error", &err)],
                            ),
                            Err(_) => log.info(&ctx, "channel closed", &[Field::new("queue", &queue)]),
                        }
                        shutdown.trigger();
                    }
                    _ = shutdown.wait() => {}
                }
            }
        };
        tokio::spawn(watcher);

        let (done, outcome) = oneshot::channel();
        *self.done.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);

        let shutdown = self.shutdown.clone();
        let deliveries = deliveries
            .take_until(async move { shutdown.wait().await })
            .boxed();
        tokio::spawn(handler(deliveries, done));

        Ok(())
    }
}
