use crate::capability::ReconcileSettings;
use crate::identity::DEFAULT_LOCAL_ID_CEILING;

#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Period of the delta cycle and of client transform pushes.
    pub update_interval_ms: u64,
    pub physics_tick_rate: u32,
    /// Peers needed before deltas go out; the authority counts itself.
    pub min_peers_for_updates: usize,
    pub local_id_ceiling: u32,
    pub max_pending_adds: usize,
    pub max_peers: usize,
    pub reconcile_3d: ReconcileSettings,
    pub reconcile_2d: ReconcileSettings,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 50,
            physics_tick_rate: 60,
            min_peers_for_updates: 2,
            local_id_ceiling: DEFAULT_LOCAL_ID_CEILING,
            max_pending_adds: 256,
            max_peers: 32,
            reconcile_3d: ReconcileSettings::DEFAULT_3D,
            reconcile_2d: ReconcileSettings::DEFAULT_2D,
        }
    }
}

impl ReplicationConfig {
    pub fn update_interval_secs(&self) -> f32 {
        self.update_interval_ms as f32 / 1000.0
    }
}
