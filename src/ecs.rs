//! `Custom::ECSService`: ECS services managed through CloudFormation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinError;
use tokio::time;

use crate::context::Context;
use crate::error::{ApiError, Error};
use crate::hash::{self, base62, hash_request, Hasher, StructuralHash};
use crate::model::IntValue;
use crate::reporter::Reporter;
use crate::{CustomResource, CustomResourceRequest, Provisioned};

/// How long the background stabilization wait may run once the provisioning
/// context is done, so its outcome still gets reported.
pub const DEFAULT_STABILIZATION_GRACE: Duration = Duration::from_secs(60);

const STABLE_DELAY: Duration = Duration::from_secs(15);
const STABLE_MAX_ATTEMPTS: usize = 40;

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct LoadBalancer {
    pub container_name: Option<String>,
    pub container_port: Option<IntValue>,
    pub load_balancer_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct DeploymentConfiguration {
    pub maximum_percent: Option<IntValue>,
    pub minimum_healthy_percent: Option<IntValue>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct EcsServiceProperties {
    pub service_name: Option<String>,
    pub cluster: Option<String>,
    pub desired_count: Option<IntValue>,
    pub load_balancers: Vec<LoadBalancer>,
    pub role: Option<String>,
    pub task_definition: Option<String>,
    pub deployment_configuration: Option<DeploymentConfiguration>,
}

// DesiredCount, TaskDefinition and DeploymentConfiguration can be updated in
// place, so they are left out.
impl StructuralHash for EcsServiceProperties {
    fn structural_hash(&self, hasher: &mut Hasher) -> Result<(), serde_json::Error> {
        hasher
            .field("ServiceName", &self.service_name)?
            .field("Cluster", &self.cluster)?
            .field("Role", &self.role)?
            .set("LoadBalancers", &self.load_balancers)?;
        Ok(())
    }
}

/// Certain properties cannot be updated on existing services, so changing
/// them means creating a new one.
pub fn requires_replacement(new: &EcsServiceProperties, old: &EcsServiceProperties) -> Result<bool, Error> {
    Ok(hash::hash(new)? != hash::hash(old)?)
}

/// Appended to the service name. It has to be deterministic for the client
/// token to make creates idempotent.
fn postfix(properties: &EcsServiceProperties) -> Result<String, Error> {
    hash::hash(properties).map(base62)
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadBalancerInput {
    pub container_name: Option<String>,
    pub container_port: Option<i32>,
    pub load_balancer_name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeploymentConfigurationInput {
    pub maximum_percent: Option<i32>,
    pub minimum_healthy_percent: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CreateServiceInput {
    pub client_token: String,
    pub service_name: Option<String>,
    pub cluster: Option<String>,
    pub desired_count: Option<i32>,
    pub role: Option<String>,
    pub task_definition: Option<String>,
    pub load_balancers: Vec<LoadBalancerInput>,
    pub deployment_configuration: Option<DeploymentConfigurationInput>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdateServiceInput {
    pub service: String,
    pub cluster: Option<String>,
    pub desired_count: Option<i32>,
    pub task_definition: Option<String>,
    pub deployment_configuration: Option<DeploymentConfigurationInput>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeleteServiceInput {
    pub service: String,
    pub cluster: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Service {
    pub service_arn: Option<String>,
    pub status: Option<String>,
    pub desired_count: i32,
    pub running_count: i32,
    pub deployments: usize,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServiceFailure {
    pub arn: Option<String>,
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DescribeServicesOutput {
    pub services: Vec<Service>,
    pub failures: Vec<ServiceFailure>,
}

/// The ECS operations the provisioner needs.
#[async_trait]
pub trait EcsClient: Send + Sync {
    async fn create_service(&self, input: CreateServiceInput) -> Result<Service, ApiError>;

    async fn update_service(&self, input: UpdateServiceInput) -> Result<(), ApiError>;

    async fn delete_service(&self, input: DeleteServiceInput) -> Result<(), ApiError>;

    async fn describe_services(&self, cluster: Option<&str>, services: &[String]) -> Result<DescribeServicesOutput, ApiError>;

    /// Polls until every service is steady, the way the `ServicesStable`
    /// waiter does.
    async fn wait_until_services_stable(&self, cluster: Option<&str>, services: &[String]) -> Result<(), Error> {
        for attempt in 1..=STABLE_MAX_ATTEMPTS {
            let output = self
                .describe_services(cluster, services)
                .await
                .map_err(Error::api("error describing services"))?;

            if let Some(failure) = output.failures.iter().find(|f| f.reason.as_ref().map(|s| &s[..]) == Some("MISSING")) {
                return Err(Error::Unstable(format!("{} is missing", failure.arn.as_ref().map_or("service", |s| &s[..]))));
            }
            if let Some(service) = output
                .services
                .iter()
                .find(|s| matches!(s.status.as_ref().map(|s| &s[..]), Some("DRAINING") | Some("INACTIVE")))
            {
                return Err(Error::Unstable(format!(
                    "{} is {}",
                    service.service_arn.as_ref().map_or("service", |s| &s[..]),
                    service.status.as_ref().map_or("", |s| &s[..])
                )));
            }
            if !output.services.is_empty() && output.services.iter().all(Service::is_stable) {
                return Ok(());
            }

            debug!("ecs.services.unstable attempt={} services={:?}", attempt, services);
            time::sleep(STABLE_DELAY).await;
        }

        Err(Error::Unstable(format!("exceeded {} attempts", STABLE_MAX_ATTEMPTS)))
    }
}

impl Service {
    fn is_stable(&self) -> bool {
        self.status.as_ref().map(|s| &s[..]) == Some("ACTIVE") && self.deployments == 1 && self.running_count == self.desired_count
    }
}

impl From<&aws_sdk_ecs::types::Service> for Service {
    fn from(service: &aws_sdk_ecs::types::Service) -> Self {
        Service {
            service_arn: service.service_arn().map(str::to_owned),
            status: service.status().map(str::to_owned),
            desired_count: service.desired_count(),
            running_count: service.running_count(),
            deployments: service.deployments().len(),
        }
    }
}

fn sdk_deployment_configuration(input: DeploymentConfigurationInput) -> aws_sdk_ecs::types::DeploymentConfiguration {
    aws_sdk_ecs::types::DeploymentConfiguration::builder()
        .set_maximum_percent(input.maximum_percent)
        .set_minimum_healthy_percent(input.minimum_healthy_percent)
        .build()
}

#[async_trait]
impl EcsClient for aws_sdk_ecs::Client {
    async fn create_service(&self, input: CreateServiceInput) -> Result<Service, ApiError> {
        let load_balancers = input
            .load_balancers
            .into_iter()
            .map(|lb| {
                aws_sdk_ecs::types::LoadBalancer::builder()
                    .set_container_name(lb.container_name)
                    .set_container_port(lb.container_port)
                    .set_load_balancer_name(lb.load_balancer_name)
                    .build()
            })
            .collect::<Vec<_>>();

        let output = self
            .create_service()
            .client_token(input.client_token)
            .set_service_name(input.service_name)
            .set_cluster(input.cluster)
            .set_desired_count(input.desired_count)
            .set_role(input.role)
            .set_task_definition(input.task_definition)
            .set_load_balancers(if load_balancers.is_empty() { None } else { Some(load_balancers) })
            .set_deployment_configuration(input.deployment_configuration.map(sdk_deployment_configuration))
            .send()
            .await?;

        Ok(output.service().map(Service::from).unwrap_or_default())
    }

    async fn update_service(&self, input: UpdateServiceInput) -> Result<(), ApiError> {
        self.update_service()
            .service(input.service)
            .set_cluster(input.cluster)
            .set_desired_count(input.desired_count)
            .set_task_definition(input.task_definition)
            .set_deployment_configuration(input.deployment_configuration.map(sdk_deployment_configuration))
            .send()
            .await?;
        Ok(())
    }

    async fn delete_service(&self, input: DeleteServiceInput) -> Result<(), ApiError> {
        self.delete_service().service(input.service).set_cluster(input.cluster).send().await?;
        Ok(())
    }

    async fn describe_services(&self, cluster: Option<&str>, services: &[String]) -> Result<DescribeServicesOutput, ApiError> {
        let output = self
            .describe_services()
            .set_cluster(cluster.map(str::to_owned))
            .set_services(Some(services.to_vec()))
            .send()
            .await?;

        Ok(DescribeServicesOutput {
            services: output.services().iter().map(Service::from).collect(),
            failures: output
                .failures()
                .iter()
                .map(|f| ServiceFailure {
                    arn: f.arn().map(str::to_owned),
                    reason: f.reason().map(str::to_owned),
                })
                .collect(),
        })
    }
}

fn int32(name: &'static str, value: Option<IntValue>) -> Result<Option<i32>, Error> {
    match value {
        Some(IntValue(v)) => i32::try_from(v).map(Some).map_err(|_| Error::OutOfRange { name, value: v }),
        None => Ok(None),
    }
}

fn deployment_configuration(properties: &EcsServiceProperties) -> Result<Option<DeploymentConfigurationInput>, Error> {
    match properties.deployment_configuration {
        Some(ref config) => Ok(Some(DeploymentConfigurationInput {
            maximum_percent: int32("MaximumPercent", config.maximum_percent)?,
            minimum_healthy_percent: int32("MinimumHealthyPercent", config.minimum_healthy_percent)?,
        })),
        None => Ok(None),
    }
}

fn report_stabilization(reporter: &dyn Reporter, result: Result<Result<(), Error>, JoinError>) {
    match result {
        Ok(Ok(())) => (),
        Ok(Err(err)) => reporter.report(&err),
        Err(err) => reporter.report(&Error::Unstable(err.to_string())),
    }
}

/// Creates, updates and deletes ECS services.
pub struct EcsServiceResource {
    ecs: Arc<dyn EcsClient>,
    reporter: Arc<dyn Reporter>,
    stabilization_grace: Duration,
}

impl EcsServiceResource {
    pub fn new(ecs: Arc<dyn EcsClient>, reporter: Arc<dyn Reporter>) -> Self {
        EcsServiceResource {
            ecs,
            reporter,
            stabilization_grace: DEFAULT_STABILIZATION_GRACE,
        }
    }

    pub fn with_stabilization_grace(mut self, grace: Duration) -> Self {
        self.stabilization_grace = grace;
        self
    }

    async fn create_service(&self, ctx: &Context, client_token: String, properties: &EcsServiceProperties) -> Result<String, Error> {
        let service_name = match properties.service_name {
            Some(ref name) => Some(format!("{}-{}", name, postfix(properties)?)),
            None => None,
        };

        let load_balancers = properties
            .load_balancers
            .iter()
            .map(|lb| {
                Ok(LoadBalancerInput {
                    container_name: lb.container_name.clone(),
                    container_port: int32("ContainerPort", lb.container_port)?,
                    load_balancer_name: lb.load_balancer_name.clone(),
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let service = self
            .ecs
            .create_service(CreateServiceInput {
                client_token,
                service_name,
                cluster: properties.cluster.clone(),
                desired_count: int32("DesiredCount", properties.desired_count)?,
                role: properties.role.clone(),
                task_definition: properties.task_definition.clone(),
                load_balancers,
                deployment_configuration: deployment_configuration(properties)?,
            })
            .await
            .map_err(Error::api("error creating service"))?;
        let arn = service.service_arn.ok_or(Error::MissingServiceArn)?;

        info!("ecs.service.created arn={}", arn);

        let mut stabilized = {
            let ecs = self.ecs.clone();
            let cluster = properties.cluster.clone();
            let services = vec![arn.clone()];
            tokio::spawn(async move { ecs.wait_until_services_stable(cluster.as_deref(), &services).await })
        };

        tokio::select! {
            result = &mut stabilized => {
                // The service was created either way. If it doesn't
                // stabilize, it's better to let the stack finish than to
                // roll it back.
                report_stabilization(&*self.reporter, result);
                Ok(arn)
            }
            err = ctx.done() => {
                let reporter = self.reporter.clone();
                let grace = self.stabilization_grace;
                let service = arn.clone();
                tokio::spawn(async move {
                    let result = time::timeout(grace, &mut stabilized).await;
                    match result {
                        Ok(result) => report_stabilization(&*reporter, result),
                        Err(_) => {
                            warn!("ecs.service.stabilization.abandoned arn={}", service);
                            stabilized.abort();
                        }
                    }
                });
                Err(Error::interrupted(arn, err))
            }
        }
    }
}

#[async_trait]
impl CustomResource for EcsServiceResource {
    type Properties = EcsServiceProperties;

    async fn create(&self, ctx: &Context, request: &CustomResourceRequest<'_, EcsServiceProperties>) -> Result<Provisioned, Error> {
        let client_token = hash_request(request.stack_id, request.request_id);
        let arn = self.create_service(ctx, client_token, &request.resource_properties).await?;
        Ok(Provisioned::new(arn))
    }

    async fn update(
        &self,
        ctx: &Context,
        request: &CustomResourceRequest<'_, EcsServiceProperties>,
        physical_resource_id: &str,
        old_resource_properties: &EcsServiceProperties,
    ) -> Result<Provisioned, Error> {
        let properties = &request.resource_properties;

        if requires_replacement(properties, old_resource_properties)? {
            // CloudFormation sends a Delete for the old service once the
            // stack update completes, so it isn't removed here.
            return match self.create(ctx, request).await {
                Err(Error::Interrupted { physical_resource_id: created, source }) => {
                    warn!("ecs.service.replacement.interrupted old={} new={} err={}", physical_resource_id, created, source);
                    Err(*source)
                }
                result => result,
            };
        }

        self.ecs
            .update_service(UpdateServiceInput {
                service: physical_resource_id.into(),
                cluster: properties.cluster.clone(),
                desired_count: int32("DesiredCount", properties.desired_count)?,
                task_definition: properties.task_definition.clone(),
                deployment_configuration: deployment_configuration(properties)?,
            })
            .await
            .map_err(Error::api("error updating service"))?;

        Ok(Provisioned::new(physical_resource_id))
    }

    async fn delete(&self, _: &Context, request: &CustomResourceRequest<'_, EcsServiceProperties>, physical_resource_id: &str) -> Result<(), Error> {
        let cluster = request.resource_properties.cluster.clone();

        // We have to scale the service down to 0 before we're able to
        // destroy it.
        let scaled = self
            .ecs
            .update_service(UpdateServiceInput {
                service: physical_resource_id.into(),
                cluster: cluster.clone(),
                desired_count: Some(0),
                ..Default::default()
            })
            .await;
        match scaled {
            Err(ref err) if err.is_service_gone() => {
                // Probably removed already.
                info!("ecs.service.gone arn={} err={}", physical_resource_id, err);
                return Ok(());
            }
            Err(err) => return Err(Error::api("error scaling service to 0")(err)),
            Ok(()) => (),
        }

        match self
            .ecs
            .delete_service(DeleteServiceInput {
                service: physical_resource_id.into(),
                cluster,
            })
            .await
        {
            Err(ref err) if err.is_service_gone() => Ok(()),
            result => result.map_err(Error::api("error deleting service")),
        }
    }
}
