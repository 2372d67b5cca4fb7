//! Consume `shout-requests`, upper-case every message and forward it to `shouted`.
//!
//! Messages that are not valid UTF-8 end up in `shout-errors`. Stop with Ctrl+C.
use carrot_conveyor::amqp::configuration::RabbitMqSettings;
use carrot_conveyor::amqp::ConnectionFactory;
use carrot_conveyor::consumers::{Consumer, ConsumerOptions, ConsumerPipeline, FeedMode};
use carrot_conveyor::pipeline::{
    Faultable, Letter, Pipeline, Processed, StepOptions, WorkState,
};
use carrot_conveyor::pool::{ChannelPool, PoolOptions};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct Text(String);

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // The out-of-the-box parameters of the RabbitMq Docker image.
    let settings = RabbitMqSettings::default();
    let factory = ConnectionFactory::new_from_config(&settings)?;
    let pool = Arc::new(ChannelPool::new(Arc::new(factory), PoolOptions::default()).await?);

    let options = ConsumerOptions {
        target_queue_name: Some("shouted".into()),
        error_queue_name: Some("shout-errors".into()),
        ..ConsumerOptions::new("shout-requests")
    };
    let target_queue = options.target_queue_name.clone().unwrap_or_default();
    let error_queue = options.error_queue_name.clone();

    let mut pipeline = Pipeline::<WorkState, WorkState>::new(
        options.consumer_pipeline.pipeline_options("shout"),
    );
    pipeline
        .add_sync_faultable_step("decode", StepOptions::default(), |state: &mut WorkState| {
            let received = state
                .received()
                .ok_or_else(|| anyhow::anyhow!("Missing message"))?;
            let text = String::from_utf8(received.body().to_vec());
            state.mark_step("decode", text.is_ok());
            state.insert(Text(text?));
            Ok::<_, anyhow::Error>(())
        })?
        .add_sync_faultable_step("shout", StepOptions::default(), move |state: &mut WorkState| {
            let text = state
                .remove::<Text>()
                .ok_or_else(|| anyhow::anyhow!("Nothing was decoded"))?;
            state.set_send_data(
                Letter::new(target_queue.clone(), text.0.to_uppercase())
                    .with_header("shouted-by", "carrot-conveyor"),
            );
            state.mark_step("shout", true);
            Ok::<_, anyhow::Error>(())
        })?;
    pipeline.finalize_async(move |processed: Processed<WorkState>| {
        let error_queue = error_queue.clone();
        async move {
            let Some(received) = processed.received().cloned() else {
                return;
            };
            let channel = received.channel().channel();
            let letter = match processed.value() {
                Some(state) if !state.is_faulted() => state.send_data().cloned(),
                Some(state) => error_queue.map(|queue| {
                    let failed_step = state.fault().map(|f| f.step_name().to_owned());
                    Letter::new(queue, received.body().to_vec())
                        .with_header("failed-step", failed_step.unwrap_or_default())
                }),
                None => error_queue.map(|queue| Letter::new(queue, received.body().to_vec())),
            };
            if let Some(letter) = letter {
                if let Err(e) = letter.send(channel.as_ref()).await {
                    tracing::error!(error = %e, "Failed to forward the message");
                    received.reject(true).await;
                    return;
                }
            }
            processed.settle().await;
        }
    })?;

    let consumer = Consumer::new("shout", options, Arc::clone(&pool))?;
    let consumer_pipeline = ConsumerPipeline::new(consumer, pipeline)?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
        }
    });
    consumer_pipeline
        .run_until_cancelled(FeedMode::Stream, shutdown)
        .await?;
    pool.shutdown().await;
    Ok(())
}
