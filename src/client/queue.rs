use crate::transport::QueueArgs;
use crate::utils::error::{MqError, Result};
use crate::utils::logging::Field;

use super::MqClient;

impl MqClient {
    /// Declare this consumer's queue and bind it to every topic.
    ///
    /// With `fresh`, any existing queue of the same name is deleted first,
    /// along with whatever messages it still holds.
    pub async fn init_queue(&self, fresh: bool) -> Result<()> {
        let (Some(device), Some(queue)) = (self.device(), self.queue_name()) else {
            return Err(MqError::Consume(
                "client has no device queue; build it with MqClient::consumer".to_string(),
            ));
        };
        let channel = self.channel().ok_or(MqError::NotConnected)?;
        let ctx = &self.ctx;

        if fresh {
            let purged = channel.delete_queue(queue).await.map_err(|err| {
                self.log.error(
                    ctx,
                    "queue delete failed",
                    &[Field::new("queue", queue), Field::new("error", &err)],
                );
                err
            })?;
            self.log.info(
                ctx,
                "queue deleted",
                &[Field::new("queue", queue), Field::new("purged", purged)],
            );
        }

        let args = QueueArgs::durable(&self.options.tuning);
        channel.declare_queue(queue, &args).await.map_err(|err| {
            self.log.error(
                ctx,
                "queue declaration failed",
                &[Field::new("queue", queue), Field::new("error", &err)],
            );
            err
        })?;
        self.log.info(ctx, "queue declared", &[Field::new("queue", queue)]);

        for topic in &self.options.topology.topics {
            let binding_key = topic.binding_key(device);
            let fields = [
                Field::new("queue", queue),
                Field::new("exchange", &topic.exchange_name),
                Field::new("binding_key", &binding_key),
            ];
            if let Err(err) = channel
                .bind_queue(queue, &topic.exchange_name, &binding_key)
                .await
            {
                let mut fields = fields.to_vec();
                fields.push(Field::new("error", &err));
                self.log.error(ctx, "queue binding failed", &fields);
                return Err(err);
            }
            self.log.info(ctx, "queue bound", &fields);
        }

        Ok(())
    }
}
