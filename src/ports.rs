//! `Custom::InstancePort`: host ports handed out to services behind a load
//! balancer.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::Context;
use crate::error::Error;
use crate::map::Map;
use crate::model::RequestType;
use crate::{CustomResource, CustomResourceRequest, Provisioned};

pub const DEFAULT_INSTANCE_PORTS: RangeInclusive<u16> = 9000..=10000;

#[async_trait]
pub trait PortAllocator: Send + Sync {
    /// Takes a free port.
    async fn get(&self) -> Result<u16, Error>;

    /// Returns a port. Returning a port that is already free is not an error.
    async fn put(&self, port: u16) -> Result<(), Error>;
}

/// Allocates ports from a fixed range, lowest first.
#[derive(Debug)]
pub struct MemoryPortAllocator {
    range: RangeInclusive<u16>,
    free: Mutex<BTreeSet<u16>>,
}

impl MemoryPortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        MemoryPortAllocator {
            free: Mutex::new(range.clone().collect()),
            range,
        }
    }

    fn free(&self) -> std::sync::MutexGuard<'_, BTreeSet<u16>> {
        // The set is never left half-updated, so a poisoned lock is still usable.
        self.free.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryPortAllocator {
    fn default() -> Self {
        MemoryPortAllocator::new(DEFAULT_INSTANCE_PORTS)
    }
}

#[async_trait]
impl PortAllocator for MemoryPortAllocator {
    async fn get(&self) -> Result<u16, Error> {
        self.free().pop_first().ok_or(Error::PortsExhausted)
    }

    async fn put(&self, port: u16) -> Result<(), Error> {
        if !self.range.contains(&port) {
            return Err(Error::InvalidPort(port.to_string()));
        }
        self.free().insert(port);
        Ok(())
    }
}

#[derive(Deserialize, Default, Debug)]
pub struct InstancePortProperties {}

pub struct InstancePortsProvisioner<A> {
    ports: A,
}

impl<A: PortAllocator> InstancePortsProvisioner<A> {
    pub fn new(ports: A) -> Self {
        InstancePortsProvisioner { ports }
    }
}

#[async_trait]
impl<A: PortAllocator> CustomResource for InstancePortsProvisioner<A> {
    type Properties = InstancePortProperties;

    async fn create(&self, _: &Context, _: &CustomResourceRequest<'_, InstancePortProperties>) -> Result<Provisioned, Error> {
        let port = self.ports.get().await?;

        Ok(Provisioned {
            physical_resource_id: port.to_string(),
            data: Some(Map::from_iter(vec![("InstancePort".to_owned(), Value::from(port))])),
        })
    }

    async fn update(&self, _: &Context, _: &CustomResourceRequest<'_, InstancePortProperties>, _: &str, _: &InstancePortProperties) -> Result<Provisioned, Error> {
        Err(Error::Unsupported(RequestType::Update))
    }

    async fn delete(&self, _: &Context, _: &CustomResourceRequest<'_, InstancePortProperties>, physical_resource_id: &str) -> Result<(), Error> {
        let port = physical_resource_id
            .parse()
            .map_err(|_| Error::InvalidPort(physical_resource_id.into()))?;

        self.ports.put(port).await
    }
}
