use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Install {
    /// Directory the capture server and its helpers are installed into. It
    /// is created on first install.
    pub dir: PathBuf,

    /// Account the capture server is installed for. The capture binary is
    /// owned by this user. Defaults to the user running the installer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Text shown in the elevation prompt.
    pub prompt: String,

    /// Icon shown in the elevation prompt, where the prompt supports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<PathBuf>,

    /// Replace installed binaries whose content is stale. Replacing a
    /// binary means prompting the user again, because the new file does not
    /// inherit the old one's permissions.
    pub overwrite: bool,

    /// File whose disappearance tells the boot-time daemon to uninstall
    /// itself. Defaults to the running executable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uninstall_sentinel: Option<PathBuf>,

    /// Directory holding freshly built binaries to install. Defaults to the
    /// directory of the running executable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<PathBuf>,
}

impl Default for Install {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/Library/Application Support/capture-helper"),
            user: None,
            prompt: "capture-helper needs permission to configure packet capture.".to_string(),
            icon: None,
            overwrite: false,
            uninstall_sentinel: None,
            artifacts: None,
        }
    }
}
