use std::{collections::BTreeMap, fmt, sync::Arc};

/// The labels an identity stands in for.
pub type Labels = BTreeMap<String, String>;

/// A numeric security identity.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NumericIdentity(pub u32);

/// A security identity observed on the local node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub id: NumericIdentity,
    pub labels: Labels,
}

/// Receives notifications as identities start and stop being used by local
/// endpoints.
pub trait IdentityObserver: Send + Sync {
    fn local_identity_added(&self, identity: &Identity);

    fn local_identity_removed(&self, identity: &Identity);
}

/// Tracks identities used by local endpoints.
pub trait IdentityManager {
    /// Registers an observer for all subsequent identity lifecycle events.
    fn subscribe(&self, observer: Arc<dyn IdentityObserver>);
}

// === impl NumericIdentity ===

impl NumericIdentity {
    /// The reserved identity of the local host.
    pub const HOST: Self = Self(1);
}

impl From<u32> for NumericIdentity {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for NumericIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// === impl Identity ===

impl Identity {
    pub fn new(id: impl Into<NumericIdentity>, labels: Labels) -> Self {
        Self {
            id: id.into(),
            labels,
        }
    }

    #[inline]
    pub fn is_host(&self) -> bool {
        self.id == NumericIdentity::HOST
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)?;
        let mut labels = self.labels.iter();
        if let Some((k, v)) = labels.next() {
            write!(f, " [{k}={v}")?;
            for (k, v) in labels {
                write!(f, ",{k}={v}")?;
            }
            f.write_str("]")?;
        }
        Ok(())
    }
}
