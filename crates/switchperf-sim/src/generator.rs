//! Simulated software traffic generator wired to the DUT's physical ports.

use switchperf_core::traffic::{
    CounterGroup, GeneratorSnapshot, SnapshotSeries, StreamSpec, TrafficDriver, TrafficError,
};

use crate::profile::Fault;
use crate::world::{GeneratorPort, SimWorld};
use crate::{lock, SharedWorld};

#[derive(Clone)]
pub struct SimTrafficGenerator {
    world: SharedWorld,
}

impl SimTrafficGenerator {
    pub(crate) fn new(world: SharedWorld) -> Self {
        Self { world }
    }
}

fn reserved<'w>(world: &'w mut SimWorld, port: &str) -> Result<&'w mut GeneratorPort, TrafficError> {
    world
        .generator
        .get_mut(port)
        .filter(|g| g.reserved)
        .ok_or_else(|| TrafficError::NotReserved(port.to_string()))
}

impl TrafficDriver for SimTrafficGenerator {
    fn reserve_port(&mut self, port: &str) -> Result<(), TrafficError> {
        let mut world = lock(&self.world);
        if !world.cabling.iter().any(|(tester, _)| tester == port) {
            return Err(TrafficError::Reservation(port.to_string()));
        }
        world.generator.entry(port.to_string()).or_default().reserved = true;
        tracing::debug!(port, "tester port reserved");
        Ok(())
    }

    fn configure_stream(&mut self, port: &str, spec: &StreamSpec) -> Result<(), TrafficError> {
        let mut world = lock(&self.world);
        reserved(&mut world, port)?.stream = Some(spec.clone());
        Ok(())
    }

    fn unconfigure_stream(&mut self, port: &str) -> Result<(), TrafficError> {
        let mut world = lock(&self.world);
        if world.has_fault(|f| *f == Fault::FailUnconfigure) {
            return Err(TrafficError::Backend(format!("stream on {port} is busy")));
        }
        let g = reserved(&mut world, port)?;
        g.running = false;
        g.stream = None;
        Ok(())
    }

    fn start(&mut self, port: &str) -> Result<(), TrafficError> {
        let mut world = lock(&self.world);
        let g = reserved(&mut world, port)?;
        if g.stream.is_none() {
            return Err(TrafficError::NotConfigured(port.to_string()));
        }
        g.running = true;
        Ok(())
    }

    fn stop(&mut self, port: &str) -> Result<(), TrafficError> {
        let mut world = lock(&self.world);
        reserved(&mut world, port)?.running = false;
        Ok(())
    }

    fn clear_statistics(&mut self, port: &str) -> Result<(), TrafficError> {
        let mut world = lock(&self.world);
        let g = reserved(&mut world, port)?;
        g.tx_packets = 0;
        g.rx_packets = 0;
        g.tx_series.clear();
        g.rx_series.clear();
        Ok(())
    }

    fn take_tx_statistics_snapshot(&mut self, port: &str) -> Result<(), TrafficError> {
        let mut world = lock(&self.world);
        let at = world.timestamp();
        let g = reserved(&mut world, port)?;
        let snapshot = GeneratorSnapshot {
            tx_total: Some(CounterGroup {
                packets: g.tx_packets,
                pps: g.tx_last as f64,
            }),
            rx_total: None,
        };
        g.tx_series.insert(at, snapshot);
        Ok(())
    }

    fn take_rx_statistics_snapshot(&mut self, port: &str) -> Result<(), TrafficError> {
        let mut world = lock(&self.world);
        let at = world.timestamp();
        let g = reserved(&mut world, port)?;
        let snapshot = GeneratorSnapshot {
            tx_total: None,
            rx_total: Some(CounterGroup {
                packets: g.rx_packets,
                pps: g.rx_last as f64,
            }),
        };
        g.rx_series.insert(at, snapshot);
        Ok(())
    }

    fn tx_statistics_snapshots(&self, port: &str) -> Result<SnapshotSeries, TrafficError> {
        let mut world = lock(&self.world);
        Ok(reserved(&mut world, port)?.tx_series.clone())
    }

    fn rx_statistics_snapshots(&self, port: &str) -> Result<SnapshotSeries, TrafficError> {
        let mut world = lock(&self.world);
        Ok(reserved(&mut world, port)?.rx_series.clone())
    }
}
