use super::*;

/// Read-only accessors used by the debug helpers and by public queues.
impl SharedPool {
    /// Pool identifier, `<name>_<id>`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration this process attached with. Names of public objects
    /// opened through this pool are derived from it.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn layout(&self) -> PoolLayout {
        self.layout
    }

    /// Get the raw pointer to the PoolHeader
    pub fn header_ptr(&self) -> *const PoolHeader {
        self.header.as_ptr()
    }

    /// True once the first attacher finished building the free lists.
    pub fn is_initialized(&self) -> bool {
        self.header().initialized.load(Ordering::Acquire) != 0
    }

    /// Number of processes currently attached to the pool segment.
    pub fn attached_processes(&self) -> i64 {
        self.segment.usage_count()
    }

    pub fn segment_name(&self) -> &str {
        self.segment.name()
    }
}
