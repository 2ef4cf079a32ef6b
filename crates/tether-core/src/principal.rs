use serde::{Deserialize, Serialize};

/// Authenticated user identity attached to a session.
///
/// Minted by whatever auth middleware fronts the upgrade endpoint;
/// the engine only carries it. Attached at most once, on successful
/// reattachment with an authenticated request context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Principal {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            display_name: None,
        }
    }
}
