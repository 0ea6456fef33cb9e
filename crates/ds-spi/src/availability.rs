//! Node-availability cache boundary.

/// Receives node health so other subsystems can skip nodes known to be down.
///
/// Calls are fire-and-forget and must not block.
pub trait NodeAvailabilityCache: Send + Sync {
    /// Records whether `node` is currently usable.
    fn set_available(&self, node: &str, available: bool);
}

/// Cache that ignores every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAvailabilityCache;

impl NodeAvailabilityCache for NullAvailabilityCache {
    fn set_available(&self, _node: &str, _available: bool) {}
}
