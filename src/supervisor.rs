/// Supervisor: one process hosting many gateway instances
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
///
/// Builds every configured gateway instance, runs them concurrently, and
/// fans the shutdown signal out through one parent cancellation token with
/// a child token per instance.

use std::sync::Arc;

use futures::future::join_all;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{GatewayError, GatewayResult};
use crate::gateway::Gateway;

/// Hosts and supervises all configured gateway instances.
pub struct Supervisor {
    gateways: Vec<Arc<Gateway>>,
    cancel: CancellationToken,
}

impl Supervisor {
    /// Build all gateway instances from the configuration. Any invalid
    /// instance aborts construction: configuration errors are fatal at
    /// startup.
    pub fn from_config(config: &Config) -> GatewayResult<Self> {
        let cancel = CancellationToken::new();

        let mut gateways = Vec::with_capacity(config.gateways.len());
        for gateway_cfg in &config.gateways {
            let gateway = Gateway::from_config(gateway_cfg, cancel.child_token())?;
            gateways.push(Arc::new(gateway));
        }

        if gateways.is_empty() {
            return Err(GatewayError::configuration("no gateways configured"));
        }

        Ok(Self { gateways, cancel })
    }

    /// Number of hosted gateway instances.
    pub fn gateway_count(&self) -> usize {
        self.gateways.len()
    }

    /// Run all instances until shutdown.
    pub async fn run(&self) -> GatewayResult<()> {
        info!("starting {} gateway instance(s)", self.gateways.len());

        let tasks: Vec<_> = self
            .gateways
            .iter()
            .map(|gateway| {
                let gateway = gateway.clone();
                let name = gateway.name().to_string();
                tokio::spawn(async move {
                    if let Err(e) = gateway.run().await {
                        error!("gateway {} stopped with error: {}", name, e);
                    }
                })
            })
            .collect();

        join_all(tasks).await;
        info!("all gateway instances stopped");
        Ok(())
    }

    /// Trigger orderly shutdown of every instance.
    pub fn shutdown(&self) {
        info!("shutting down");
        self.cancel.cancel();
    }
}
