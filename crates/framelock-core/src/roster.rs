//! The endpoint roster and the shared memory plan derived from it.
//!
//! Process index 0 is always the master; indices `1..=n` are slaves. Each
//! slave is either coupled (acknowledges every frame) or decoupled (may lag
//! by whole frames).
//!
//! With the shared memory transport the master writes into one fan-out ring
//! read by all coupled slaves together, plus one private ring per decoupled
//! slave. Every slave writes its replies into a ring of its own. The region
//! order inside the segment is:
//!
//! ```text
//! [coupled fan-out (if any)][decoupled 1]..[decoupled k][client 1]..[client n]
//! ```

use crate::config::{IpcConfig, SessionConfig};
use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};

/// Synchronization mode of a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlaveMode {
    Coupled,
    Decoupled,
}

/// Ordered list of the processes taking part in a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    slaves: Vec<SlaveMode>,
}

impl Roster {
    /// Build a roster from the modes of slaves `1..=n`, in order.
    pub fn new(slaves: Vec<SlaveMode>) -> Self {
        Self { slaves }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        let slaves = config
            .processes
            .iter()
            .skip(1)
            .map(|p| {
                if p.decoupled {
                    SlaveMode::Decoupled
                } else {
                    SlaveMode::Coupled
                }
            })
            .collect();
        Self { slaves }
    }

    /// Number of processes including the master.
    pub fn process_count(&self) -> usize {
        self.slaves.len() + 1
    }

    pub fn slave_count(&self) -> usize {
        self.slaves.len()
    }

    pub fn coupled_count(&self) -> usize {
        self.slaves
            .iter()
            .filter(|m| **m == SlaveMode::Coupled)
            .count()
    }

    /// Process indices of all slaves.
    pub fn slave_indices(&self) -> std::ops::RangeInclusive<usize> {
        1..=self.slaves.len()
    }

    /// Mode of the slave with the given process index.
    pub fn mode(&self, process_index: usize) -> Result<SlaveMode> {
        process_index
            .checked_sub(1)
            .and_then(|i| self.slaves.get(i))
            .copied()
            .ok_or_else(|| {
                SyncError::protocol(format!(
                    "process index {} is not a slave (valid: 1..={})",
                    process_index,
                    self.slaves.len()
                ))
            })
    }

    pub fn is_decoupled(&self, process_index: usize) -> bool {
        matches!(self.mode(process_index), Ok(SlaveMode::Decoupled))
    }

    /// Shared memory plan with the default region sizes.
    pub fn shared_memory_plan(&self) -> SharedMemoryPlan {
        SharedMemoryPlan::new(
            self,
            IpcConfig::SERVER_REGION_SIZE,
            IpcConfig::CLIENT_REGION_SIZE,
        )
    }
}

/// Where one slave finds its two rings inside the shared segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlaveSlot {
    /// Index of the server->client region this slave reads.
    pub writer_region: usize,
    /// Reader cursor this slave owns in that region.
    pub reader_slot: usize,
    /// Number of readers attached to that region.
    pub region_readers: usize,
}

/// Layout of the shared memory segment for a roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedMemoryPlan {
    server_region_size: usize,
    client_region_size: usize,
    coupled_count: usize,
    writer_regions: usize,
    slots: Vec<SlaveSlot>,
}

impl SharedMemoryPlan {
    pub fn new(roster: &Roster, server_region_size: usize, client_region_size: usize) -> Self {
        let coupled_count = roster.coupled_count();
        let mut writer_regions = usize::from(coupled_count > 0);
        let mut next_coupled_reader = 0;
        let mut slots = Vec::with_capacity(roster.slave_count());

        for mode in &roster.slaves {
            match mode {
                SlaveMode::Coupled => {
                    slots.push(SlaveSlot {
                        writer_region: 0,
                        reader_slot: next_coupled_reader,
                        region_readers: coupled_count,
                    });
                    next_coupled_reader += 1;
                }
                SlaveMode::Decoupled => {
                    slots.push(SlaveSlot {
                        writer_region: writer_regions,
                        reader_slot: 0,
                        region_readers: 1,
                    });
                    writer_regions += 1;
                }
            }
        }

        Self {
            server_region_size,
            client_region_size,
            coupled_count,
            writer_regions,
            slots,
        }
    }

    /// Number of server->client regions.
    pub fn writer_regions(&self) -> usize {
        self.writer_regions
    }

    pub fn coupled_count(&self) -> usize {
        self.coupled_count
    }

    pub fn server_region_size(&self) -> usize {
        self.server_region_size
    }

    pub fn client_region_size(&self) -> usize {
        self.client_region_size
    }

    /// Number of readers of the given server->client region.
    pub fn region_readers(&self, region: usize) -> usize {
        if region == 0 && self.coupled_count > 0 {
            self.coupled_count
        } else {
            1
        }
    }

    /// Slot of the slave with the given process index.
    pub fn slot(&self, process_index: usize) -> Result<SlaveSlot> {
        process_index
            .checked_sub(1)
            .and_then(|i| self.slots.get(i))
            .copied()
            .ok_or_else(|| {
                SyncError::protocol(format!(
                    "process index {} has no shared memory slot",
                    process_index
                ))
            })
    }

    /// Byte offset of a server->client region.
    pub fn server_region_offset(&self, region: usize) -> usize {
        region * self.server_region_size
    }

    /// Byte offset of the client->server region of a slave.
    pub fn client_region_offset(&self, process_index: usize) -> usize {
        self.writer_regions * self.server_region_size
            + (process_index - 1) * self.client_region_size
    }

    /// Size of the whole shared segment.
    pub fn total_size(&self) -> usize {
        self.writer_regions * self.server_region_size + self.slots.len() * self.client_region_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessConfig;

    fn mixed_roster() -> Roster {
        // process 1 decoupled, 2 and 3 coupled, 4 decoupled
        Roster::new(vec![
            SlaveMode::Decoupled,
            SlaveMode::Coupled,
            SlaveMode::Coupled,
            SlaveMode::Decoupled,
        ])
    }

    #[test]
    fn test_roster_counts() {
        let roster = mixed_roster();
        assert_eq!(roster.process_count(), 5);
        assert_eq!(roster.slave_count(), 4);
        assert_eq!(roster.coupled_count(), 2);
        assert!(roster.is_decoupled(1));
        assert!(!roster.is_decoupled(2));
        assert!(!roster.is_decoupled(0));
        assert!(roster.mode(5).is_err());
        assert_eq!(roster.slave_indices().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_roster_from_config() {
        let config = SessionConfig {
            processes: vec![
                ProcessConfig::new("master"),
                ProcessConfig::new("a"),
                ProcessConfig::new("b").decoupled(true),
            ],
            ..Default::default()
        };
        let roster = Roster::from_config(&config);
        assert_eq!(roster.mode(1).unwrap(), SlaveMode::Coupled);
        assert_eq!(roster.mode(2).unwrap(), SlaveMode::Decoupled);
    }

    #[test]
    fn test_plan_puts_coupled_group_first() {
        let plan = SharedMemoryPlan::new(&mixed_roster(), 1000, 100);
        assert_eq!(plan.writer_regions(), 3);

        let s1 = plan.slot(1).unwrap();
        assert_eq!((s1.writer_region, s1.reader_slot, s1.region_readers), (1, 0, 1));
        let s2 = plan.slot(2).unwrap();
        assert_eq!((s2.writer_region, s2.reader_slot, s2.region_readers), (0, 0, 2));
        let s3 = plan.slot(3).unwrap();
        assert_eq!((s3.writer_region, s3.reader_slot, s3.region_readers), (0, 1, 2));
        let s4 = plan.slot(4).unwrap();
        assert_eq!((s4.writer_region, s4.reader_slot), (2, 0));

        assert_eq!(plan.region_readers(0), 2);
        assert_eq!(plan.region_readers(2), 1);
        assert_eq!(plan.server_region_offset(2), 2000);
        assert_eq!(plan.client_region_offset(1), 3000);
        assert_eq!(plan.client_region_offset(4), 3300);
        assert_eq!(plan.total_size(), 3400);
    }

    #[test]
    fn test_plan_without_coupled_slaves() {
        let roster = Roster::new(vec![SlaveMode::Decoupled, SlaveMode::Decoupled]);
        let plan = SharedMemoryPlan::new(&roster, 10, 1);
        assert_eq!(plan.writer_regions(), 2);
        assert_eq!(plan.slot(1).unwrap().writer_region, 0);
        assert_eq!(plan.slot(2).unwrap().writer_region, 1);
        assert_eq!(plan.region_readers(0), 1);
    }
}
