/// Gateway instance: routing and dispatch
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
///
/// A gateway bridges its upstreams (masters talking to us) to its
/// downstreams (slaves we talk to) through a routing table keyed by slave
/// id, with an optional default route. Dispatch applies a per-exchange
/// safety timeout and expresses every gateway-layer failure as a Modbus
/// exception PDU, so upstream masters always see protocol-correct replies:
///
/// | condition                     | exception |
/// |-------------------------------|-----------|
/// | no route, no default          | 0x0A      |
/// | timeout (safety or scanner)   | 0x0B      |
/// | any other downstream failure  | 0x04      |
///
/// Serialization against each downstream is the downstream's own lease;
/// two upstreams hitting the same RTU bus are strictly serialized while
/// traffic to different downstreams proceeds in parallel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::downstream::{build_downstream, Downstream};
use crate::error::{GatewayError, GatewayResult};
use crate::protocol::{ExceptionCode, Pdu, SlaveId};
use crate::upstream::{build_upstream, RequestHandler, Upstream};

/// Per-exchange safety timeout applied around every downstream send
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(2);

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway").field("name", &self.name).finish()
    }
}

/// A single gateway instance.
pub struct Gateway {
    name: String,
    upstreams: Vec<Arc<dyn Upstream>>,
    /// Unique downstream instances, for connect/close fan-out
    downstreams: Vec<Arc<dyn Downstream>>,
    routes: HashMap<SlaveId, Arc<dyn Downstream>>,
    default_route: Option<Arc<dyn Downstream>>,
    exchange_timeout: Duration,
    cancel: CancellationToken,
}

impl Gateway {
    /// Assemble a gateway from already-built parts.
    pub fn new(
        name: &str,
        upstreams: Vec<Arc<dyn Upstream>>,
        downstreams: Vec<Arc<dyn Downstream>>,
        routes: HashMap<SlaveId, Arc<dyn Downstream>>,
        default_route: Option<Arc<dyn Downstream>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name: name.to_string(),
            upstreams,
            downstreams,
            routes,
            default_route,
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
            cancel,
        }
    }

    /// Build a gateway instance from its configuration block.
    ///
    /// Route setup rules: a slave id routed to two downstreams is a fatal
    /// configuration error; at most one downstream may omit `slave_ids`
    /// and becomes the default route; a downstream whose id set parses to
    /// empty is unreachable and rejected with a warning.
    pub fn from_config(cfg: &GatewayConfig, cancel: CancellationToken) -> GatewayResult<Gateway> {
        if cfg.upstreams.is_empty() {
            return Err(GatewayError::configuration(format!(
                "gateway {} has no upstreams",
                cfg.name
            )));
        }
        if cfg.downstreams.is_empty() {
            return Err(GatewayError::configuration(format!(
                "gateway {} has no downstreams",
                cfg.name
            )));
        }

        let mut upstreams = Vec::with_capacity(cfg.upstreams.len());
        for upstream_cfg in &cfg.upstreams {
            upstreams.push(build_upstream(upstream_cfg, cancel.child_token())?);
        }

        let mut downstreams: Vec<Arc<dyn Downstream>> = Vec::new();
        let mut routes: HashMap<SlaveId, Arc<dyn Downstream>> = HashMap::new();
        let mut default_route: Option<Arc<dyn Downstream>> = None;

        for downstream_cfg in &cfg.downstreams {
            let label = if downstream_cfg.name.is_empty() {
                downstream_cfg.kind.clone()
            } else {
                downstream_cfg.name.clone()
            };

            match &downstream_cfg.slave_ids {
                None => {
                    if default_route.is_some() {
                        return Err(GatewayError::configuration(format!(
                            "gateway {} has more than one default downstream",
                            cfg.name
                        )));
                    }
                    let downstream = build_downstream(downstream_cfg)?;
                    downstreams.push(downstream.clone());
                    default_route = Some(downstream);
                }
                Some(id_spec) => {
                    let ids = parse_slave_ids(id_spec)?;
                    if ids.is_empty() {
                        warn!(
                            "gateway {}: downstream {} has an empty slave id set and is unreachable, skipping",
                            cfg.name, label
                        );
                        continue;
                    }
                    let downstream = build_downstream(downstream_cfg)?;
                    downstreams.push(downstream.clone());
                    for id in ids {
                        if routes.insert(id, downstream.clone()).is_some() {
                            return Err(GatewayError::configuration(format!(
                                "gateway {}: slave id {} is routed to more than one downstream",
                                cfg.name, id
                            )));
                        }
                    }
                }
            }
        }

        Ok(Gateway::new(
            &cfg.name,
            upstreams,
            downstreams,
            routes,
            default_route,
            cancel,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Override the per-exchange safety timeout.
    pub fn set_exchange_timeout(&mut self, timeout: Duration) {
        self.exchange_timeout = timeout;
    }

    /// Signal this instance to shut down.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Run the instance until cancellation: connect downstreams (tolerating
    /// initial failures), start all upstreams, then unwind in order on
    /// shutdown: upstreams stop accepting first, downstreams close last.
    pub async fn run(self: Arc<Self>) -> GatewayResult<()> {
        for downstream in &self.downstreams {
            if let Err(e) = downstream.connect().await {
                // The downstream may recover on first use
                error!("gateway {}: failed to connect downstream: {}", self.name, e);
            }
        }

        let mut tasks = Vec::with_capacity(self.upstreams.len());
        for (index, upstream) in self.upstreams.iter().enumerate() {
            info!("gateway {}: starting upstream {}", self.name, index);
            let upstream = upstream.clone();
            let handler: Arc<dyn RequestHandler> = self.clone();
            let name = self.name.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = upstream.start(handler).await {
                    error!("gateway {}: upstream {} stopped with error: {}", name, index, e);
                }
            }));
        }

        self.cancel.cancelled().await;

        for upstream in &self.upstreams {
            upstream.close();
        }
        join_all(tasks).await;

        for downstream in &self.downstreams {
            if let Err(e) = downstream.close().await {
                error!("gateway {}: failed to close downstream: {}", self.name, e);
            }
        }

        Ok(())
    }

    /// Central dispatch: route by slave id, forward under the safety
    /// timeout, map failures to exception PDUs.
    pub async fn dispatch(&self, slave_id: SlaveId, request: &Pdu) -> GatewayResult<Pdu> {
        let target = match self.routes.get(&slave_id).or(self.default_route.as_ref()) {
            Some(downstream) => downstream.clone(),
            None => {
                warn!("gateway {}: no route for slave id {}", self.name, slave_id);
                return Ok(Pdu::exception(
                    request.function_code,
                    ExceptionCode::GatewayPathUnavailable,
                ));
            }
        };

        let exchange = tokio::time::timeout(self.exchange_timeout, target.send(slave_id, request));
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return Err(GatewayError::Cancelled),
            result = exchange => result,
        };

        match result {
            Ok(Ok(pdu)) => Ok(pdu),
            Ok(Err(e)) if e.is_timeout() => {
                error!(
                    "gateway {}: downstream timed out for slave {} fc 0x{:02X}: {}",
                    self.name, slave_id, request.function_code, e
                );
                Ok(Pdu::exception(
                    request.function_code,
                    ExceptionCode::GatewayTargetDeviceFailedToRespond,
                ))
            }
            Ok(Err(e)) => {
                error!(
                    "gateway {}: downstream request failed for slave {} fc 0x{:02X}: {}",
                    self.name, slave_id, request.function_code, e
                );
                Ok(Pdu::exception(
                    request.function_code,
                    ExceptionCode::ServerDeviceFailure,
                ))
            }
            Err(_) => {
                error!(
                    "gateway {}: safety timeout elapsed for slave {} fc 0x{:02X}",
                    self.name, slave_id, request.function_code
                );
                Ok(Pdu::exception(
                    request.function_code,
                    ExceptionCode::GatewayTargetDeviceFailedToRespond,
                ))
            }
        }
    }
}

#[async_trait]
impl RequestHandler for Gateway {
    async fn handle(&self, slave_id: SlaveId, pdu: &Pdu) -> GatewayResult<Pdu> {
        self.dispatch(slave_id, pdu).await
    }
}

/// Parse a slave id specification ("1", "1,2", "5-10", "1, 3-4") into the
/// listed ids. Tokens are decimal integers or inclusive `a-b` ranges, all
/// within 0..=255; whitespace around tokens is tolerated and empty tokens
/// are skipped.
pub fn parse_slave_ids(input: &str) -> GatewayResult<Vec<u8>> {
    let mut ids = Vec::new();

    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if let Some((start, end)) = part.split_once('-') {
            let start: u16 = start.trim().parse().map_err(|_| {
                GatewayError::configuration(format!("invalid start of range: {}", part))
            })?;
            let end: u16 = end.trim().parse().map_err(|_| {
                GatewayError::configuration(format!("invalid end of range: {}", part))
            })?;
            if start > end {
                return Err(GatewayError::configuration(format!(
                    "start of range {} is greater than end {}",
                    start, end
                )));
            }
            if end > 255 {
                return Err(GatewayError::configuration(format!(
                    "id out of range: {}",
                    end
                )));
            }
            for id in start..=end {
                ids.push(id as u8);
            }
        } else {
            let id: u16 = part
                .parse()
                .map_err(|_| GatewayError::configuration(format!("invalid id: {}", part)))?;
            if id > 255 {
                return Err(GatewayError::configuration(format!("id out of range: {}", id)));
            }
            ids.push(id as u8);
        }
    }

    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    struct SlowDownstream(Duration);

    #[async_trait]
    impl Downstream for SlowDownstream {
        async fn connect(&self) -> GatewayResult<()> {
            Ok(())
        }
        async fn send(&self, _slave_id: SlaveId, pdu: &Pdu) -> GatewayResult<Pdu> {
            tokio::time::sleep(self.0).await;
            Ok(Pdu::new(pdu.function_code, vec![0x02, 0x00, 0x2A]))
        }
        async fn close(&self) -> GatewayResult<()> {
            Ok(())
        }
    }

    struct FailingDownstream;

    #[async_trait]
    impl Downstream for FailingDownstream {
        async fn connect(&self) -> GatewayResult<()> {
            Ok(())
        }
        async fn send(&self, _slave_id: SlaveId, _pdu: &Pdu) -> GatewayResult<Pdu> {
            Err(GatewayError::io("wire cut"))
        }
        async fn close(&self) -> GatewayResult<()> {
            Ok(())
        }
    }

    fn gateway_with(routes: HashMap<SlaveId, Arc<dyn Downstream>>) -> Gateway {
        Gateway::new(
            "test",
            Vec::new(),
            routes.values().cloned().collect(),
            routes,
            None,
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_parse_slave_ids() {
        assert_eq!(parse_slave_ids("1,2,5-7, 10").unwrap(), vec![1, 2, 5, 6, 7, 10]);
        assert_eq!(parse_slave_ids("0").unwrap(), vec![0]);
        assert_eq!(parse_slave_ids("255").unwrap(), vec![255]);
        assert_eq!(parse_slave_ids("").unwrap(), Vec::<u8>::new());
        assert_eq!(parse_slave_ids("1, ,2").unwrap(), vec![1, 2]);

        assert!(parse_slave_ids("5-3").is_err());
        assert!(parse_slave_ids("256").is_err());
        assert!(parse_slave_ids("250-300").is_err());
        assert!(parse_slave_ids("pump").is_err());
    }

    #[tokio::test]
    async fn test_dispatch_no_route() {
        let gateway = gateway_with(HashMap::new());
        let resp = gateway
            .dispatch(2, &Pdu::new(0x03, vec![0x00, 0x00, 0x00, 0x01]))
            .await
            .unwrap();
        assert_eq!(resp.function_code, 0x83);
        assert_eq!(resp.data, vec![0x0A]);
    }

    #[tokio::test]
    async fn test_dispatch_default_route() {
        let mut gateway = gateway_with(HashMap::new());
        gateway.default_route = Some(Arc::new(SlowDownstream(Duration::from_millis(1))));

        let resp = gateway
            .dispatch(42, &Pdu::new(0x03, vec![0x00, 0x00, 0x00, 0x01]))
            .await
            .unwrap();
        assert_eq!(resp.function_code, 0x03);
    }

    #[tokio::test]
    async fn test_dispatch_safety_timeout() {
        let mut routes: HashMap<SlaveId, Arc<dyn Downstream>> = HashMap::new();
        routes.insert(1, Arc::new(SlowDownstream(Duration::from_secs(10))));
        let mut gateway = gateway_with(routes);
        gateway.set_exchange_timeout(Duration::from_millis(50));

        let resp = gateway
            .dispatch(1, &Pdu::new(0x03, vec![0x00, 0x00, 0x00, 0x01]))
            .await
            .unwrap();
        assert_eq!(resp.function_code, 0x83);
        assert_eq!(resp.data, vec![0x0B]);
    }

    #[tokio::test]
    async fn test_dispatch_downstream_failure() {
        let mut routes: HashMap<SlaveId, Arc<dyn Downstream>> = HashMap::new();
        routes.insert(1, Arc::new(FailingDownstream));
        let gateway = gateway_with(routes);

        let resp = gateway
            .dispatch(1, &Pdu::new(0x06, vec![0x00, 0x01, 0x00, 0x02]))
            .await
            .unwrap();
        assert_eq!(resp.function_code, 0x86);
        assert_eq!(resp.data, vec![0x04]);
    }

    #[tokio::test]
    async fn test_dispatch_cancelled() {
        let mut routes: HashMap<SlaveId, Arc<dyn Downstream>> = HashMap::new();
        routes.insert(1, Arc::new(SlowDownstream(Duration::from_secs(10))));
        let cancel = CancellationToken::new();
        let gateway = Gateway::new(
            "test",
            Vec::new(),
            Vec::new(),
            routes,
            None,
            cancel.clone(),
        );

        cancel.cancel();
        let err = gateway
            .dispatch(1, &Pdu::new(0x03, vec![0x00, 0x00, 0x00, 0x01]))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled));
    }

    #[test]
    fn test_duplicate_route_is_fatal() {
        let yaml = r#"
gateways:
  - name: "dup"
    upstreams:
      - type: "tcp"
        tcp: { address: "127.0.0.1:45620" }
    downstreams:
      - type: "tcp"
        slave_ids: "1-5"
        tcp: { address: "127.0.0.1:1502" }
      - type: "tcp"
        slave_ids: "5"
        tcp: { address: "127.0.0.1:1503" }
"#;
        let config = Config::from_yaml(yaml).unwrap();
        let err = Gateway::from_config(&config.gateways[0], CancellationToken::new()).unwrap_err();
        assert!(matches!(err, GatewayError::Configuration { .. }));
        assert!(format!("{}", err).contains("slave id 5"));
    }

    #[test]
    fn test_two_defaults_are_fatal() {
        let yaml = r#"
gateways:
  - name: "defaults"
    upstreams:
      - type: "tcp"
        tcp: { address: "127.0.0.1:45621" }
    downstreams:
      - type: "tcp"
        tcp: { address: "127.0.0.1:1502" }
      - type: "tcp"
        tcp: { address: "127.0.0.1:1503" }
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert!(Gateway::from_config(&config.gateways[0], CancellationToken::new()).is_err());
    }

    #[test]
    fn test_empty_id_set_skipped() {
        let yaml = r#"
gateways:
  - name: "empty-ids"
    upstreams:
      - type: "tcp"
        tcp: { address: "127.0.0.1:45622" }
    downstreams:
      - type: "tcp"
        slave_ids: " , "
        tcp: { address: "127.0.0.1:1502" }
      - type: "local"
        slave_ids: "1"
"#;
        let config = Config::from_yaml(yaml).unwrap();
        let gateway = Gateway::from_config(&config.gateways[0], CancellationToken::new()).unwrap();
        assert_eq!(gateway.downstreams.len(), 1);
        assert!(gateway.routes.contains_key(&1));
    }
}
