//! Queue functions, priorities and family bindings.

/// Sentinel queue family meaning "no ownership transfer".
pub const QUEUE_FAMILY_IGNORED: u32 = u32::MAX;

/// The class of hardware queue a command buffer is recorded for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueFunction {
    Graphics,
    Compute,
    Transfer,
}

impl QueueFunction {
    /// Every queue function, in index order.
    pub const ALL: [QueueFunction; 3] = [Self::Graphics, Self::Compute, Self::Transfer];

    /// Dense index, used for per-queue tables.
    pub fn index(self) -> usize {
        match self {
            Self::Graphics => 0,
            Self::Compute => 1,
            Self::Transfer => 2,
        }
    }
}

impl std::fmt::Display for QueueFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Graphics => write!(f, "graphics"),
            Self::Compute => write!(f, "compute"),
            Self::Transfer => write!(f, "transfer"),
        }
    }
}

/// Submission priority. Backends with several queues per family map higher
/// priorities onto queues created with a higher priority value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum QueuePriority {
    Low,
    #[default]
    Medium,
    High,
    SuperHigh,
}

impl QueuePriority {
    /// Normalized priority in `[0, 1]` as used for queue creation.
    pub fn as_f32(self) -> f32 {
        match self {
            Self::Low => 0.0,
            Self::Medium => 0.33,
            Self::High => 0.66,
            Self::SuperHigh => 1.0,
        }
    }
}

/// Maps each queue function to the queue family index it executes on.
///
/// Devices without a dedicated compute or transfer family fall back to the
/// graphics family, in which case no ownership transfers are needed between
/// those functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueFamilies {
    families: [u32; 3],
}

impl QueueFamilies {
    /// Explicit family per function.
    pub fn new(graphics: u32, compute: u32, transfer: u32) -> Self {
        Self {
            families: [graphics, compute, transfer],
        }
    }

    /// Every function runs on the same family.
    pub fn unified(family: u32) -> Self {
        Self::new(family, family, family)
    }

    /// Family index for a queue function.
    pub fn family(&self, function: QueueFunction) -> u32 {
        self.families[function.index()]
    }

    /// Returns `true` if the function has its own family, distinct from graphics.
    pub fn is_dedicated(&self, function: QueueFunction) -> bool {
        function == QueueFunction::Graphics
            || self.family(function) != self.family(QueueFunction::Graphics)
    }

    /// Returns the function owning `family`, preferring graphics when shared.
    pub fn function_of(&self, family: u32) -> Option<QueueFunction> {
        QueueFunction::ALL
            .into_iter()
            .find(|function| self.family(*function) == family)
    }
}

impl Default for QueueFamilies {
    fn default() -> Self {
        Self::unified(0)
    }
}
