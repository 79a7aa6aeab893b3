#[macro_use]
extern crate log;

use std::sync::Arc;

use clap::Parser;

use cloudformation_provisioner::config::Config;
use cloudformation_provisioner::ecs::EcsServiceResource;
use cloudformation_provisioner::ports::{InstancePortsProvisioner, MemoryPortAllocator};
use cloudformation_provisioner::reporter::{LogReporter, Reporter};
use cloudformation_provisioner::{CustomResourceProvisioner, Provisioners, ResponseClient, SqsDispatcher};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::parse();

    let aws = aws_config::load_from_env().await;
    let reporter: Arc<dyn Reporter> = Arc::new(LogReporter);

    let mut provisioners = Provisioners::with_timeout(config.provisioning_timeout(), config.provisioning_grace());
    provisioners
        .add(
            "Custom::ECSService",
            EcsServiceResource::new(Arc::new(aws_sdk_ecs::Client::new(&aws)), reporter.clone()).with_stabilization_grace(config.provisioning_grace()),
        )
        .add("Custom::InstancePort", InstancePortsProvisioner::new(MemoryPortAllocator::new(config.instance_ports.clone())));

    let handler = Arc::new(CustomResourceProvisioner::new(provisioners, Arc::new(ResponseClient::new())));

    let dispatcher = SqsDispatcher::new(Arc::new(aws_sdk_sqs::Client::new(&aws)), config.queue_url.clone())
        .with_visibility_heartbeat(config.visibility_heartbeat())
        .with_workers(config.workers)
        .with_reporter(reporter);

    let stopper = dispatcher.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupted, stopping");
                stopper.stop();
            }
            Err(err) => error!("error waiting for ctrl-c: {}", err),
        }
    });

    dispatcher.start(handler).await;
}
