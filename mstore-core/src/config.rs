/// How `create`/`fill` treat attributes outside the fillable set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtraAttributePolicy {
    /// Reject the data with a validation error
    #[default]
    Strict,
    /// Log a warning and drop the attributes
    Warn,
    /// Silently drop the attributes
    Off,
}

/// Store configuration, fixed at construction
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Handling of unknown or non-fillable attributes in bulk assignment
    pub extra_attributes: ExtraAttributePolicy,

    /// Number of lock stripes used to serialize writers per record and bucket
    pub lock_stripes: usize,

    /// Repair interrupted index updates when reading
    pub reconcile_on_read: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            extra_attributes: ExtraAttributePolicy::Strict,
            lock_stripes: 64,
            reconcile_on_read: true,
        }
    }
}

impl StoreConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the extra attribute policy
    pub fn with_extra_attributes(mut self, policy: ExtraAttributePolicy) -> Self {
        self.extra_attributes = policy;
        self
    }

    /// Set the number of lock stripes
    pub fn with_lock_stripes(mut self, stripes: usize) -> Self {
        self.lock_stripes = stripes;
        self
    }

    /// Enable or disable read-time reconciliation
    pub fn with_reconcile_on_read(mut self, enabled: bool) -> Self {
        self.reconcile_on_read = enabled;
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.lock_stripes == 0 {
            return Err("lock_stripes must be greater than 0".to_string());
        }

        Ok(())
    }
}
