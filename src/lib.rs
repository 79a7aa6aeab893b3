#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate log;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

pub mod config;
pub mod context;
pub mod ecs;
pub mod error;
pub mod hash;
pub mod map;
pub mod model;
pub mod ports;
pub mod queue;
pub mod reporter;
pub mod response;
pub mod timeout;

pub use context::Context;
pub use error::{ApiError, Error};
pub use map::Map;
pub use model::{Request, RequestType, Response, Status};
pub use queue::{Handler, Message, SqsDispatcher};
pub use response::{ResponseClient, SendResponse};
pub use timeout::WithTimeout;

pub const PHYSICAL_RESOURCE_ID_FAILURE: &str = "FAILURE";
const SERVICE_TOKEN_KEY: &str = "ServiceToken";

/// How long provisioners get to do their thing.
pub const PROVISIONING_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// And how long they get to clean up once that runs out.
pub const PROVISIONING_GRACE_TIMEOUT: Duration = Duration::from_secs(60);

/// A request, with its properties decoded for a particular resource type.
#[derive(Clone, Debug)]
pub struct CustomResourceRequest<'a, P> {
    pub stack_id: &'a str,
    pub request_id: &'a str,
    pub resource_type: &'a str,
    pub logical_resource_id: &'a str,
    pub resource_properties: P,
}

/// The outcome of a successful provisioning operation.
#[derive(Clone, Default, Debug, PartialEq)]
pub struct Provisioned {
    pub physical_resource_id: String,
    pub data: Option<Map>,
}

impl Provisioned {
    pub fn new<S: Into<String>>(physical_resource_id: S) -> Self {
        Provisioned {
            physical_resource_id: physical_resource_id.into(),
            data: None,
        }
    }
}

/// A custom resource type with typed properties.
///
/// Wrap implementations in [`Resource`], or register them with
/// [`Provisioners::add`], to route requests to them.
#[async_trait]
pub trait CustomResource: Send + Sync {
    /// Properties are decoded into this type. Empty property maps decode to
    /// `Default::default()`.
    type Properties: DeserializeOwned + Default + Send + Sync;

    async fn create(&self, ctx: &Context, request: &CustomResourceRequest<'_, Self::Properties>) -> Result<Provisioned, Error>;

    async fn update(
        &self,
        ctx: &Context,
        request: &CustomResourceRequest<'_, Self::Properties>,
        physical_resource_id: &str,
        old_resource_properties: &Self::Properties,
    ) -> Result<Provisioned, Error>;

    async fn delete(&self, ctx: &Context, request: &CustomResourceRequest<'_, Self::Properties>, physical_resource_id: &str) -> Result<(), Error>;
}

/// Something that can provision custom resources.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Provisions the request, returning the physical id and any data.
    ///
    /// An error may still carry a physical id (see
    /// [`Error::physical_resource_id`]) when the resource exists in spite of
    /// it.
    async fn provision(&self, ctx: &Context, request: &Request) -> Result<Provisioned, Error>;
}

/// Routes create, update and delete requests to a [`CustomResource`].
pub struct Resource<R>(pub R);

fn decode<P: DeserializeOwned + Default>(mut properties: Map) -> Result<P, Error> {
    // Not necessary and can conflict with serde(deny_unknown_fields)
    properties.remove(SERVICE_TOKEN_KEY);

    if properties.is_empty() {
        return Ok(P::default());
    }
    properties.deserialize_into().map_err(Error::Properties)
}

#[async_trait]
impl<R: CustomResource> Provisioner for Resource<R> {
    async fn provision(&self, ctx: &Context, request: &Request) -> Result<Provisioned, Error> {
        let physical_resource_id = request.physical_resource_id.as_ref().map(|s| &s[..]);

        // Nothing was ever created for a resource that failed with no id.
        if let (RequestType::Delete, Some(PHYSICAL_RESOURCE_ID_FAILURE)) = (request.request_type, physical_resource_id) {
            return Ok(Provisioned::new(PHYSICAL_RESOURCE_ID_FAILURE));
        }

        let req = CustomResourceRequest {
            stack_id: &request.stack_id,
            request_id: &request.request_id,
            resource_type: &request.resource_type,
            logical_resource_id: &request.logical_resource_id,
            resource_properties: decode(request.resource_properties.clone())?,
        };

        match (request.request_type, physical_resource_id) {
            (RequestType::Create, None) => self.0.create(ctx, &req).await,
            (RequestType::Update, Some(physical_resource_id)) => {
                let old_resource_properties = decode(request.old_resource_properties.clone())?;
                self.0.update(ctx, &req, physical_resource_id, &old_resource_properties).await
            }
            (RequestType::Delete, Some(physical_resource_id)) => {
                self.0.delete(ctx, &req, physical_resource_id).await?;
                Ok(Provisioned::new(physical_resource_id))
            }
            (RequestType::Create, Some(physical_resource_id)) => Err(Error::UnexpectedPhysicalResourceId(physical_resource_id.into())),
            (_, None) => Err(Error::MissingPhysicalResourceId),
        }
    }
}

/// Provisioners keyed by resource type, e.g. `Custom::ECSService`.
pub struct Provisioners {
    provisioners: HashMap<String, Arc<dyn Provisioner>>,
    timeout: Duration,
    grace: Duration,
}

impl Provisioners {
    pub fn new() -> Self {
        Provisioners::with_timeout(PROVISIONING_TIMEOUT, PROVISIONING_GRACE_TIMEOUT)
    }

    /// Resources added later are bounded by `timeout`, plus `grace` to clean up.
    pub fn with_timeout(timeout: Duration, grace: Duration) -> Self {
        Provisioners {
            provisioners: HashMap::new(),
            timeout,
            grace,
        }
    }

    pub fn add<R: CustomResource + 'static>(&mut self, resource_type: &str, resource: R) -> &mut Self {
        let provisioner = WithTimeout::new(Resource(resource), self.timeout, self.grace);
        self.insert(resource_type, provisioner)
    }

    /// Registers a provisioner as is, without a timeout.
    pub fn insert<P: Provisioner + 'static>(&mut self, resource_type: &str, provisioner: P) -> &mut Self {
        self.provisioners.insert(resource_type.into(), Arc::new(provisioner));
        self
    }

    pub fn get(&self, resource_type: &str) -> Option<&dyn Provisioner> {
        self.provisioners.get(resource_type).map(|p| &**p)
    }

    pub fn resource_types(&self) -> impl Iterator<Item = &str> {
        self.provisioners.keys().map(|k| &k[..])
    }
}

impl Default for Provisioners {
    fn default() -> Self {
        Provisioners::new()
    }
}

/// Provisions a request, turning the outcome into the response for it.
pub async fn provision(provisioner: &dyn Provisioner, ctx: &Context, request: &Request) -> Response {
    match provisioner.provision(ctx, request).await {
        Ok(provisioned) => {
            let mut response = Response::from_request(request, Status::Success, provisioned.physical_resource_id);
            response.data = provisioned.data;
            info!("cloudformation.provision request={:?} response={:?}", request, response);
            response
        }
        Err(err) => {
            let physical_resource_id = err
                .physical_resource_id()
                .map(str::to_owned)
                .or_else(|| request.physical_resource_id.clone())
                .unwrap_or_else(|| PHYSICAL_RESOURCE_ID_FAILURE.into());
            let mut response = Response::from_request(request, Status::Failed, physical_resource_id);
            response.reason = Some(err.to_string());
            error!("cloudformation.provision.error request={:?} response={:?} err={}", request, response, err);
            response
        }
    }
}

/// Handles custom resource requests delivered through SQS: provisions them,
/// then responds back to CloudFormation.
pub struct CustomResourceProvisioner {
    provisioners: Provisioners,
    responder: Arc<dyn SendResponse>,
}

impl CustomResourceProvisioner {
    pub fn new(provisioners: Provisioners, responder: Arc<dyn SendResponse>) -> Self {
        CustomResourceProvisioner { provisioners, responder }
    }
}

#[async_trait]
impl Handler for CustomResourceProvisioner {
    async fn handle(&self, ctx: &Context, message: &Message) -> Result<(), Error> {
        let notification: model::Notification = serde_json::from_str(&message.body).map_err(Error::Envelope)?;
        let request: Request = serde_json::from_str(&notification.message).map_err(Error::MalformedRequest)?;

        // Without a provisioner there is no way to tell what a response
        // should say, so the message is left for redelivery instead.
        let provisioner = match self.provisioners.get(&request.resource_type) {
            Some(provisioner) => provisioner,
            None => return Err(Error::NoProvisioner(request.resource_type)),
        };

        let response = provision(provisioner, ctx, &request).await;

        // Stopped mid-flight; the request will be provisioned again.
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        tokio::select! {
            result = self.responder.send_response(&request, &response) => result,
            err = ctx.done() => Err(err),
        }
    }
}
