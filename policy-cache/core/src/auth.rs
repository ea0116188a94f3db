use std::{collections::BTreeSet, fmt, str::FromStr};

/// A kind of authentication that policy may require between two identities.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AuthType {
    Disabled,
    Spire,
    AlwaysFail,
}

/// A set of required authentication types.
pub type AuthTypes = BTreeSet<AuthType>;

#[derive(Debug, thiserror::Error)]
#[error("invalid authentication type: {0}")]
pub struct InvalidAuthType(String);

// === impl AuthType ===

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Spire => "spire",
            Self::AlwaysFail => "test-always-fail",
        }
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthType {
    type Err = InvalidAuthType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(Self::Disabled),
            "spire" => Ok(Self::Spire),
            "test-always-fail" => Ok(Self::AlwaysFail),
            s => Err(InvalidAuthType(s.to_string())),
        }
    }
}
