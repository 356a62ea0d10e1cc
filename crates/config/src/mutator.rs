use serde::{Deserialize, Serialize};

/// How the capture engine treats captured packets before saving them.
///
/// The set is closed: the capture server only understands these two modes,
/// and anything else is rejected while the configuration is read.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutator {
    /// Save packets untouched.
    #[default]
    #[serde(rename = "noop")]
    NoOp,

    /// Strip application-layer payloads, keeping transport headers.
    #[serde(rename = "strip-app-layer")]
    StripApplicationLayer,
}

impl Mutator {
    pub fn strips_app_layer(self) -> bool {
        matches!(self, Mutator::StripApplicationLayer)
    }
}
