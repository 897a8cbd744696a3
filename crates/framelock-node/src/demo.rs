//! The demo application replicated between master and slaves.
//!
//! Static data names the scene; every frame carries a tick with the frame
//! number and elapsed time. Slaves answer every `event_interval` frames with
//! one JSON-encoded event so the master has something to collect.

use async_trait::async_trait;
use framelock_core::{RecordBatch, RenderArgs, SyncError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneInfo {
    pub name: String,
    pub event_interval: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameTick {
    pub frame: u64,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveEvent {
    pub process: usize,
    pub frame: u64,
}

pub fn encode<T: Serialize>(value: &T) -> framelock_core::Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> framelock_core::Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Decode the events of one slave batch. The payload is one JSON array.
pub fn decode_events(batch: &RecordBatch) -> framelock_core::Result<Vec<SlaveEvent>> {
    if batch.is_empty() {
        return Ok(Vec::new());
    }
    let events: Vec<SlaveEvent> = decode(&batch.payload)?;
    if events.len() != batch.count as usize {
        return Err(SyncError::protocol(format!(
            "event batch announces {} events but holds {}",
            batch.count,
            events.len()
        )));
    }
    Ok(events)
}

/// Slave side of the demo.
#[derive(Debug)]
pub struct DemoSlave {
    process: usize,
    scene: Option<SceneInfo>,
    last_tick: Option<FrameTick>,
    devices: usize,
}

impl DemoSlave {
    pub fn new(process: usize) -> Self {
        Self {
            process,
            scene: None,
            last_tick: None,
            devices: 0,
        }
    }

    pub fn last_tick(&self) -> Option<FrameTick> {
        self.last_tick
    }
}

#[async_trait]
impl framelock_core::SlaveHandler for DemoSlave {
    async fn init(&mut self, static_data: Vec<u8>) -> framelock_core::Result<()> {
        let scene: SceneInfo = decode(&static_data)?;
        info!("Slave {} loaded scene '{}'", self.process, scene.name);
        self.scene = Some(scene);
        Ok(())
    }

    async fn device(&mut self, device: Vec<u8>) -> framelock_core::Result<()> {
        self.devices += 1;
        debug!("Slave {} got device record of {} bytes", self.process, device.len());
        Ok(())
    }

    async fn render(&mut self, args: RenderArgs) -> framelock_core::Result<RecordBatch> {
        let tick: FrameTick = decode(&args.dynamic_data)?;
        debug!(
            "Slave {} rendering frame {} (clip {}..{})",
            self.process, tick.frame, args.clip.near, args.clip.far
        );
        self.last_tick = Some(tick);

        let interval = self.scene.as_ref().map_or(0, |s| s.event_interval);
        if interval == 0 || tick.frame % interval != 0 {
            return Ok(RecordBatch::empty());
        }
        let events = [SlaveEvent {
            process: self.process,
            frame: tick.frame,
        }];
        Ok(RecordBatch::new(1, encode(&events)?))
    }

    async fn quit(&mut self) -> framelock_core::Result<()> {
        info!(
            "Slave {} quitting after frame {:?} ({} device records)",
            self.process,
            self.last_tick.map(|t| t.frame),
            self.devices
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framelock_core::{ClipPlanes, SlaveHandler};

    fn render_args(frame: u64) -> RenderArgs {
        RenderArgs {
            clip: ClipPlanes::new(0.1, 50.0),
            dynamic_data: encode(&FrameTick {
                frame,
                elapsed_ms: frame * 16,
            })
            .unwrap(),
        }
    }

    #[tokio::test]
    async fn test_events_every_interval() {
        let mut slave = DemoSlave::new(2);
        let scene = SceneInfo {
            name: "lab".to_string(),
            event_interval: 3,
        };
        slave.init(encode(&scene).unwrap()).await.unwrap();

        let quiet = slave.render(render_args(4)).await.unwrap();
        assert!(quiet.is_empty());

        let batch = slave.render(render_args(6)).await.unwrap();
        let events = decode_events(&batch).unwrap();
        assert_eq!(events, vec![SlaveEvent { process: 2, frame: 6 }]);
        assert_eq!(slave.last_tick().unwrap().frame, 6);
    }

    #[test]
    fn test_count_mismatch_is_rejected() {
        let events = [SlaveEvent { process: 1, frame: 1 }];
        let batch = RecordBatch::new(2, encode(&events).unwrap());
        assert!(decode_events(&batch).is_err());
    }
}
