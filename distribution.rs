use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::device::{Device, EnergyMode, Ess};
use crate::grid::ExternalGrid;
use crate::types::{EngineError, MarketConfig, Schedule, Trade};

/// One delivered energy flow, as seen by the observer sink.
#[derive(Clone, Debug, Serialize)]
pub struct FlowRecord {
    #[serde(flatten)]
    pub trade: Trade,
    /// "weekday:hour" of the slot the flow happened in.
    pub datetime: String,
}

/// The distribution layer: an arena of devices keyed by string id, the shared
/// storage system, and the append-only flow record sink.
///
/// Devices are registered once before the first slot; `power_flow` is the
/// only place device state (and the external bill) is mutated.
pub struct Microgrid {
    name: String,
    ess_id: String,
    devices: BTreeMap<String, Box<dyn Device>>,
    flows: Vec<FlowRecord>,
}

impl Microgrid {
    pub fn new(name: &str, config: &MarketConfig) -> Self {
        let ess = Ess::new(config);
        let ess_id = ess.id().to_string();
        let mut devices: BTreeMap<String, Box<dyn Device>> = BTreeMap::new();
        devices.insert(ess_id.clone(), Box::new(ess));
        Self { name: name.to_string(), ess_id, devices, flows: Vec::new() }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn ess_id(&self) -> &str {
        &self.ess_id
    }

    pub fn register(&mut self, device: Box<dyn Device>) {
        self.devices.insert(device.id().to_string(), device);
    }

    pub fn device(&self, id: &str) -> Option<&dyn Device> {
        self.devices.get(id).map(|d| d.as_ref())
    }

    /// Current storage fill.
    pub fn ess_energy(&self, s: Schedule) -> f64 {
        self.devices.get(&self.ess_id).map(|d| d.supply(s)).unwrap_or(0.0)
    }

    /// Move `trade.amount` from the supplier device (or the external grid)
    /// to the consumer device. Returns the amount actually delivered.
    ///
    /// Unknown endpoints fail before any state is touched; a zero-amount
    /// trade is a no-op.
    pub fn power_flow(
        &mut self,
        grid: &mut ExternalGrid,
        trade: &Trade,
        s: Schedule,
    ) -> Result<f64, EngineError> {
        if trade.amount <= 0.0 {
            return Ok(0.0);
        }

        let dst = trade.consumer_device_id.as_str();
        let consumer_known = self
            .devices
            .get(dst)
            .map(|d| d.energy_mode().contains(EnergyMode::CONSUMER))
            .unwrap_or(false);
        if !consumer_known {
            return Err(EngineError::UnknownDevice(dst.to_string()));
        }

        let src = trade.supplier_device_id.as_str();
        let flow = if let Some(producer) = self.devices.get_mut(src) {
            if !producer.energy_mode().contains(EnergyMode::PRODUCER) {
                return Err(EngineError::UnknownDevice(src.to_string()));
            }
            producer.discharge(s, trade.amount)
        } else if src == grid.name() {
            grid.allocate(&trade.consumer_id, trade.amount, s)?
        } else {
            return Err(EngineError::UnknownDevice(src.to_string()));
        };

        if let Some(consumer) = self.devices.get_mut(dst) {
            consumer.charge(s, flow);
        }

        debug!(
            mode = trade.mode.as_str(),
            supplier = %src,
            consumer = %dst,
            amount = flow,
            price = trade.price,
            slot = %s,
            "energy delivered"
        );
        self.flows.push(FlowRecord { trade: trade.clone(), datetime: s.to_string() });
        Ok(flow)
    }

    /// Everything delivered so far, in delivery order.
    pub fn flow_records(&self) -> &[FlowRecord] {
        &self.flows
    }
}
