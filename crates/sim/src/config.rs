use std::time::Duration;

use canopy::ReplicationConfig;

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub clients: usize,
    pub seconds: f32,
    pub frame_rate: u32,
    pub update_interval_ms: u64,
    pub crates: usize,
    /// Seconds between button presses from a client.
    pub press_every: f32,
    /// Seconds between crate despawn/spawn pairs.
    pub respawn_every: f32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            clients: 2,
            seconds: 10.0,
            frame_rate: 60,
            update_interval_ms: 50,
            crates: 4,
            press_every: 2.0,
            respawn_every: 3.0,
        }
    }
}

impl SimConfig {
    pub fn replication(&self) -> ReplicationConfig {
        ReplicationConfig {
            update_interval_ms: self.update_interval_ms,
            max_peers: self.clients.max(1),
            ..Default::default()
        }
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate.max(1) as f64)
    }

    pub fn total_frames(&self) -> u64 {
        (self.seconds.max(0.0) * self.frame_rate as f32).round() as u64
    }
}
