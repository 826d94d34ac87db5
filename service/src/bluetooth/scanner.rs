//! LE advertisement scanning.
//!
//! One scanner task runs per adapter while that adapter has sessions. It
//! collects Apple proximity-pairing payloads with their RSSI and flushes
//! them to the manager in batches.

use std::time::{Duration, Instant};

use bluer::{Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport};
use futures::{StreamExt, pin_mut};
use log::{debug, info, trace, warn};
use smol_str::SmolStr;
use tokio::{
   select,
   sync::mpsc,
   task::JoinHandle,
   time::{self, MissedTickBehavior},
};

use crate::{
   airpods::{
      arbiter::ScanObservation,
      protocol::{APPLE_CID, PP_PAYLOAD_LEN},
   },
   error::Result,
};

/// Observations collected on one adapter during one report interval.
#[derive(Debug)]
pub struct ScanBatch {
   pub adapter: SmolStr,
   pub observations: Vec<ScanObservation>,
}

/// Starts discovery on `adapter`; stopping is aborting the returned task.
pub fn spawn_scanner(
   adapter: Adapter,
   name: SmolStr,
   report_delay: Duration,
   tx: mpsc::Sender<ScanBatch>,
) -> JoinHandle<()> {
   tokio::spawn(async move {
      info!("Starting LE scan on {name}");
      if let Err(e) = run_scanner(&adapter, &name, report_delay, &tx).await {
         warn!("LE scan on {name} failed: {e}");
      }
      debug!("LE scan on {name} ended");
   })
}

async fn run_scanner(
   adapter: &Adapter,
   name: &SmolStr,
   report_delay: Duration,
   tx: &mpsc::Sender<ScanBatch>,
) -> Result<()> {
   adapter
      .set_discovery_filter(DiscoveryFilter {
         transport: DiscoveryTransport::Le,
         duplicate_data: true,
         ..Default::default()
      })
      .await?;

   // Property changes of known devices are reported as `DeviceAdded` too.
   let events = adapter.discover_devices_with_changes().await?;
   pin_mut!(events);

   let mut flush = time::interval(report_delay);
   flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
   let mut pending = Vec::new();

   loop {
      select! {
          event = events.next() => {
              let Some(event) = event else {
                  break;
              };
              if let AdapterEvent::DeviceAdded(addr) = event
                 && let Some(obs) = observe(adapter, addr).await
              {
                 pending.push(obs);
              }
          }
          _ = flush.tick() => {
              if pending.is_empty() {
                  continue;
              }
              let batch = ScanBatch {
                  adapter: name.clone(),
                  observations: std::mem::take(&mut pending),
              };
              if tx.send(batch).await.is_err() {
                  debug!("Scan batch receiver closed, stopping scan on {name}");
                  break;
              }
          }
      }
   }

   Ok(())
}

/// Reads the current advertisement of `addr`, if it carries a
/// proximity-pairing sized Apple payload.
async fn observe(adapter: &Adapter, addr: Address) -> Option<ScanObservation> {
   let device = adapter.device(addr).ok()?;
   let mut data = device.manufacturer_data().await.ok()??;
   let payload = data.remove(&APPLE_CID)?;
   if payload.len() != PP_PAYLOAD_LEN {
      return None;
   }
   let rssi = device.rssi().await.ok()??;
   trace!("Advertisement from {addr} rssi={rssi}: {}", hex::encode(&payload));
   Some(ScanObservation {
      address: addr,
      rssi,
      observed_at: Instant::now(),
      payload,
   })
}
