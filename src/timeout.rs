use std::time::Duration;

use async_trait::async_trait;
use tokio::time;

use crate::context::Context;
use crate::error::Error;
use crate::model::Request;
use crate::{Provisioned, Provisioner};

/// Bounds a provisioner by a timeout.
///
/// Once the timeout passes, the provisioner's context is done but it gets an
/// additional grace period to clean up and return its own result. If it is
/// still running after that, the context's error is returned instead.
pub struct WithTimeout<P> {
    provisioner: P,
    timeout: Duration,
    grace: Duration,
}

impl<P> WithTimeout<P> {
    pub fn new(provisioner: P, timeout: Duration, grace: Duration) -> Self {
        WithTimeout {
            provisioner,
            timeout,
            grace,
        }
    }
}

#[async_trait]
impl<P: Provisioner> Provisioner for WithTimeout<P> {
    async fn provision(&self, ctx: &Context, request: &Request) -> Result<Provisioned, Error> {
        let ctx = ctx.with_timeout(self.timeout);

        let work = self.provisioner.provision(&ctx, request);
        tokio::pin!(work);

        let err = tokio::select! {
            result = &mut work => return result,
            err = ctx.done() => err,
        };

        debug!(
            "{} {} is past its timeout, waiting {:?} for it to clean up",
            request.request_type, request.logical_resource_id, self.grace
        );

        match time::timeout(self.grace, work).await {
            Ok(result) => result,
            Err(_) => Err(err),
        }
    }
}
