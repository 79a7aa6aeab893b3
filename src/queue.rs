//! At-least-once processing of SQS messages.
//!
//! Messages stay invisible to other consumers while they are being handled,
//! and are only deleted once their handler succeeds. Anything else is
//! redelivered after the visibility timeout lapses.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio::time::{self, Sleep};
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::{ApiError, Error};
use crate::reporter::{LogReporter, Reporter};

pub const DEFAULT_VISIBILITY_HEARTBEAT: Duration = Duration::from_secs(60);
pub const DEFAULT_NUM_WORKERS: usize = 10;

const WAIT_TIME_SECONDS: i32 = 20;
const MAX_NUMBER_OF_MESSAGES: i32 = 10;
const RECEIVE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// SQS visibility timeouts are whole seconds, and zero makes a message
/// visible again immediately.
const MIN_VISIBILITY_HEARTBEAT: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub message_id: Option<String>,
    pub receipt_handle: String,
    pub body: String,
}

/// The SQS operations the dispatcher needs.
#[async_trait]
pub trait SqsClient: Send + Sync {
    async fn receive_message(&self, queue_url: &str) -> Result<Vec<Message>, ApiError>;

    async fn change_message_visibility(&self, queue_url: &str, receipt_handle: &str, visibility_timeout: i32) -> Result<(), ApiError>;

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<(), ApiError>;
}

#[async_trait]
impl SqsClient for aws_sdk_sqs::Client {
    async fn receive_message(&self, queue_url: &str) -> Result<Vec<Message>, ApiError> {
        let output = self
            .receive_message()
            .queue_url(queue_url)
            .wait_time_seconds(WAIT_TIME_SECONDS)
            .max_number_of_messages(MAX_NUMBER_OF_MESSAGES)
            .send()
            .await?;

        let mut messages = Vec::new();
        for message in output.messages() {
            match (message.receipt_handle(), message.body()) {
                (Some(receipt_handle), Some(body)) => messages.push(Message {
                    message_id: message.message_id().map(str::to_owned),
                    receipt_handle: receipt_handle.into(),
                    body: body.into(),
                }),
                _ => warn!("skipping message without receipt handle or body: {:?}", message.message_id()),
            }
        }
        Ok(messages)
    }

    async fn change_message_visibility(&self, queue_url: &str, receipt_handle: &str, visibility_timeout: i32) -> Result<(), ApiError> {
        self.change_message_visibility()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(visibility_timeout)
            .send()
            .await?;
        Ok(())
    }

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<(), ApiError> {
        self.delete_message().queue_url(queue_url).receipt_handle(receipt_handle).send().await?;
        Ok(())
    }
}

/// Handles a single message. The context is cancelled when the dispatcher
/// stops.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &Context, message: &Message) -> Result<(), Error>;
}

pub struct HandlerFn<F>(F);

/// Adapts a closure into a [`Handler`].
pub fn handler_fn<F>(f: F) -> HandlerFn<F> {
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Context, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    async fn handle(&self, ctx: &Context, message: &Message) -> Result<(), Error> {
        (self.0)(ctx.clone(), message.clone()).await
    }
}

/// Pulls messages off a queue and hands them to a [`Handler`].
#[derive(Clone)]
pub struct SqsDispatcher {
    queue_url: String,
    visibility_heartbeat: Duration,
    num_workers: usize,
    sqs: Arc<dyn SqsClient>,
    reporter: Arc<dyn Reporter>,
    stopped: CancellationToken,
}

impl SqsDispatcher {
    pub fn new<S: Into<String>>(sqs: Arc<dyn SqsClient>, queue_url: S) -> Self {
        SqsDispatcher {
            queue_url: queue_url.into(),
            visibility_heartbeat: DEFAULT_VISIBILITY_HEARTBEAT,
            num_workers: DEFAULT_NUM_WORKERS,
            sqs,
            reporter: Arc::new(LogReporter),
            stopped: CancellationToken::new(),
        }
    }

    /// How long messages stay invisible per extension. They are extended
    /// again every half of this while their handler runs. Raised to at
    /// least one second.
    pub fn with_visibility_heartbeat(mut self, visibility_heartbeat: Duration) -> Self {
        self.visibility_heartbeat = visibility_heartbeat.max(MIN_VISIBILITY_HEARTBEAT);
        self
    }

    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers.max(1);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Runs until [`stop`](Self::stop) is called and every in-flight message
    /// has been handled.
    pub async fn start<H: Handler + 'static>(&self, handler: Arc<H>) {
        info!("sqs.dispatcher.start queue_url={} workers={}", self.queue_url, self.num_workers);

        let mut workers = JoinSet::new();
        for _ in 0..self.num_workers {
            let dispatcher = self.clone();
            let handler = handler.clone();
            workers.spawn(async move { dispatcher.work(handler).await });
        }

        while let Some(result) = workers.join_next().await {
            if let Err(err) = result {
                error!("sqs.dispatcher.worker.error err={}", err);
            }
        }

        info!("sqs.dispatcher.stopped queue_url={}", self.queue_url);
    }

    /// Stops receiving messages, and cancels handlers in progress.
    pub fn stop(&self) {
        self.stopped.cancel()
    }

    async fn work<H: Handler + 'static>(&self, handler: Arc<H>) {
        let mut inflight = JoinSet::new();

        loop {
            let received = tokio::select! {
                _ = self.stopped.cancelled() => break,
                received = self.sqs.receive_message(&self.queue_url) => received,
            };

            match received {
                Ok(messages) => {
                    for message in messages {
                        let dispatcher = self.clone();
                        let handler = handler.clone();
                        inflight.spawn(async move {
                            if let Err(err) = dispatcher.handle(&*handler, message).await {
                                dispatcher.report(&err);
                            }
                        });
                    }
                }
                Err(err) => {
                    self.report(&Error::api("error receiving messages")(err));
                    tokio::select! {
                        _ = self.stopped.cancelled() => break,
                        _ = time::sleep(RECEIVE_RETRY_DELAY) => {}
                    }
                }
            }

            while inflight.try_join_next().is_some() {}
        }

        while inflight.join_next().await.is_some() {}
    }

    /// Handles a message, keeping it invisible until the handler returns.
    /// The message is deleted only if the handler succeeds.
    pub async fn handle<H: Handler + ?Sized>(&self, handler: &H, message: Message) -> Result<(), Error> {
        let ctx = Context::from_token(self.stopped.child_token());

        let mut heartbeat = self.extend_message_visibility_timeout(&message.receipt_handle).await?;

        let result = {
            let work = handler.handle(&ctx, &message);
            tokio::pin!(work);

            loop {
                tokio::select! {
                    result = &mut work => break result,
                    _ = &mut heartbeat => {
                        heartbeat = self.extend_message_visibility_timeout(&message.receipt_handle).await?;
                    }
                }
            }
        };
        result?;

        self.sqs
            .delete_message(&self.queue_url, &message.receipt_handle)
            .await
            .map_err(Error::api("error deleting message"))
    }

    /// Pushes the visibility timeout out by a full heartbeat, returning the
    /// timer for the next extension.
    async fn extend_message_visibility_timeout(&self, receipt_handle: &str) -> Result<Pin<Box<Sleep>>, Error> {
        let visibility_timeout = whole_seconds(self.visibility_heartbeat);
        self.sqs
            .change_message_visibility(&self.queue_url, receipt_handle, visibility_timeout)
            .await
            .map_err(Error::api("error extending message visibility timeout"))?;

        Ok(Box::pin(time::sleep(self.visibility_heartbeat / 2)))
    }

    fn report(&self, err: &Error) {
        if err.is_canceled() && self.stopped.is_cancelled() {
            info!("sqs.dispatcher.handler.canceled err={}", err);
        } else {
            self.reporter.report(err);
        }
    }
}

/// Rounds up, so the message never becomes visible before the next extension.
fn whole_seconds(duration: Duration) -> i32 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    i32::try_from(secs).unwrap_or(i32::MAX)
}
