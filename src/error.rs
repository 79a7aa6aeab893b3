use std::fmt;

use aws_sdk_ecs::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use hyper::StatusCode;
use thiserror::Error;

use crate::model::RequestType;

/// Error codes ECS uses for a service that no longer exists.
const SERVICE_GONE_CODES: &[&str] = &["ServiceNotActiveException", "ServiceNotFoundException"];

#[derive(Debug, Error)]
pub enum Error {
    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// The resource was created, but the operation did not run to completion.
    #[error("{physical_resource_id}: {source}")]
    Interrupted {
        physical_resource_id: String,
        #[source]
        source: Box<Error>,
    },

    #[error("no provisioner for {0}")]
    NoProvisioner(String),

    #[error("error unmarshalling sqs message body: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("error unmarshalling to cloudformation request: {0}")]
    MalformedRequest(#[source] serde_json::Error),

    #[error("error unmarshalling resource properties: {0}")]
    Properties(#[source] serde_json::Error),

    #[error("error hashing properties: {0}")]
    Hash(#[source] serde_json::Error),

    #[error("{0} is not supported")]
    Unsupported(RequestType),

    #[error("physical_resource_id expected")]
    MissingPhysicalResourceId,

    #[error("Unexpected physical_resource_id {0}")]
    UnexpectedPhysicalResourceId(String),

    #[error("physical resource id should have been a port number: {0}")]
    InvalidPort(String),

    #[error("no instance ports available")]
    PortsExhausted,

    #[error("{name} is out of range: {value}")]
    OutOfRange { name: &'static str, value: i64 },

    #[error("{action}: {source}")]
    Api {
        action: &'static str,
        #[source]
        source: ApiError,
    },

    #[error("create service response did not include a service arn")]
    MissingServiceArn,

    #[error("services did not stabilize: {0}")]
    Unstable(String),

    #[error("unexpected response from pre-signed url: {status}: {body}")]
    ResponseStatus { status: StatusCode, body: String },

    #[error("no answer from pre-signed url after {0:?}")]
    ResponseTimeout(std::time::Duration),

    #[error("error encoding response: {0}")]
    Encode(#[source] serde_json::Error),

    #[error(transparent)]
    Http(#[from] hyper::http::Error),

    #[error(transparent)]
    Transport(#[from] hyper_util::client::legacy::Error),

    #[error(transparent)]
    Body(#[from] hyper::Error),
}

impl Error {
    pub fn api(action: &'static str) -> impl FnOnce(ApiError) -> Error {
        move |source| Error::Api { action, source }
    }

    /// Attaches the id of a resource that already exists to an error.
    pub fn interrupted<S: Into<String>>(physical_resource_id: S, source: Error) -> Error {
        Error::Interrupted {
            physical_resource_id: physical_resource_id.into(),
            source: Box::new(source),
        }
    }

    /// The physical id of a resource that exists in spite of the error.
    pub fn physical_resource_id(&self) -> Option<&str> {
        match *self {
            Error::Interrupted { ref physical_resource_id, .. } => Some(&physical_resource_id[..]),
            _ => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        match *self {
            Error::Canceled => true,
            Error::Interrupted { ref source, .. } => source.is_canceled(),
            _ => false,
        }
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        match *self {
            Error::DeadlineExceeded => true,
            Error::Interrupted { ref source, .. } => source.is_deadline_exceeded(),
            _ => false,
        }
    }
}

/// An error returned by a remote AWS API, reduced to its code and message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiError {
    pub code: Option<String>,
    pub message: String,
}

impl ApiError {
    pub fn new<C: Into<String>, M: Into<String>>(code: C, message: M) -> Self {
        ApiError {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Whether ECS reports the service as already removed.
    pub fn is_service_gone(&self) -> bool {
        self.code.as_ref().map_or(false, |c| SERVICE_GONE_CODES.contains(&&c[..]))
            || self.message.contains("Service was not ACTIVE")
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self.code {
            Some(ref code) => write!(fmt, "{}: {}", code, self.message),
            None => fmt::Display::fmt(&self.message, fmt),
        }
    }
}

impl std::error::Error for ApiError {}

// SQS and ECS share the smithy error types, so this covers both clients.
impl<E, R> From<SdkError<E, R>> for ApiError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: fmt::Debug,
{
    fn from(err: SdkError<E, R>) -> Self {
        let code = err.code().map(str::to_owned);
        let message = match err.message() {
            Some(message) => message.to_owned(),
            None => DisplayErrorContext(&err).to_string(),
        };
        ApiError { code, message }
    }
}
