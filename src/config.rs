use std::ops::RangeInclusive;
use std::time::Duration;

use clap::Parser;

/// Provisions CloudFormation custom resources delivered through SQS.
#[derive(Parser, Debug, Clone)]
#[command(name = "cloudformation-provisioner")]
pub struct Config {
    /// SQS queue that CloudFormation custom resource requests are delivered to
    #[arg(long, env = "CUSTOM_RESOURCES_QUEUE_URL")]
    pub queue_url: String,

    /// Seconds that a message stays invisible per extension while it's being handled
    #[arg(long, env = "CUSTOM_RESOURCES_VISIBILITY_HEARTBEAT", default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
    pub visibility_heartbeat: u64,

    /// Number of workers polling the queue
    #[arg(long, env = "CUSTOM_RESOURCES_WORKERS", default_value_t = 10)]
    pub workers: usize,

    /// Seconds a provisioner gets to provision a resource
    #[arg(long, env = "CUSTOM_RESOURCES_PROVISIONING_TIMEOUT", default_value_t = 20 * 60)]
    pub provisioning_timeout: u64,

    /// Seconds a provisioner gets to clean up after the provisioning timeout
    #[arg(long, env = "CUSTOM_RESOURCES_PROVISIONING_GRACE", default_value_t = 60)]
    pub provisioning_grace: u64,

    /// Range of host ports that Custom::InstancePort allocates from, as LOW-HIGH
    #[arg(long, env = "CUSTOM_RESOURCES_INSTANCE_PORTS", default_value = "9000-10000", value_parser = parse_port_range)]
    pub instance_ports: RangeInclusive<u16>,
}

impl Config {
    pub fn visibility_heartbeat(&self) -> Duration {
        Duration::from_secs(self.visibility_heartbeat)
    }

    pub fn provisioning_timeout(&self) -> Duration {
        Duration::from_secs(self.provisioning_timeout)
    }

    pub fn provisioning_grace(&self) -> Duration {
        Duration::from_secs(self.provisioning_grace)
    }
}

fn parse_port_range(s: &str) -> Result<RangeInclusive<u16>, String> {
    let (low, high) = s.split_once('-').ok_or_else(|| format!("expected LOW-HIGH, got {:?}", s))?;
    let low: u16 = low.trim().parse().map_err(|e| format!("invalid low port {:?}: {}", low, e))?;
    let high: u16 = high.trim().parse().map_err(|e| format!("invalid high port {:?}: {}", high, e))?;
    if low > high {
        return Err(format!("empty port range {}-{}", low, high));
    }
    Ok(low..=high)
}
