//! Registration settings loaded from TOML
//!
//! ```toml
//! name = "audit"
//! base = "memdb"
//! make_default = false
//! max_pathname = 512
//! ```

use crate::error::{Result, VfsError};
use crate::vfs::BaseVfs;
use serde::{Deserialize, Serialize};
use std::path::Path;
use validator::Validate;

/// Settings for one VFS registration
///
/// # Examples
///
/// ```
/// use layervfs::VfsConfig;
///
/// let config = VfsConfig::from_toml_str(r#"
///     name = "audit"
///     max_pathname = 512
/// "#).unwrap();
///
/// assert_eq!(config.name, "audit");
/// assert!(!config.make_default);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct VfsConfig {
    /// Name the VFS is registered under
    #[validate(length(min = 1, max = 255))]
    pub name: String,

    /// VFS to inherit from; empty or absent means SQLite's default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,

    #[serde(default)]
    pub make_default: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 64, max = 65536))]
    pub max_pathname: Option<u32>,
}

impl VfsConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: None,
            make_default: false,
            max_pathname: None,
        }
    }

    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    pub fn with_max_pathname(mut self, max_pathname: u32) -> Self {
        self.max_pathname = Some(max_pathname);
        self
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: VfsConfig = toml::from_str(source)?;
        config.validate_config()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| VfsError::Config(e.to_string()))
    }

    /// Field constraints plus the checks the derive cannot express.
    pub fn validate_config(&self) -> Result<()> {
        self.validate()?;
        if self.name.contains('\0') {
            return Err(VfsError::Config(String::from("name contains a NUL byte")));
        }
        if self.base.as_deref().is_some_and(|base| base.contains('\0')) {
            return Err(VfsError::Config(String::from("base contains a NUL byte")));
        }
        if self.base.as_deref() == Some(self.name.as_str()) {
            return Err(VfsError::Config(format!(
                "VFS {} cannot be its own base",
                self.name
            )));
        }
        Ok(())
    }

    /// Base name for [`BaseVfs::find`], `""` for the default VFS.
    pub fn base_name(&self) -> &str {
        self.base.as_deref().unwrap_or("")
    }

    /// Looks up the configured base, or `None` when no base is configured.
    ///
    /// # Errors
    ///
    /// Whatever [`BaseVfs::find`] reports for the configured name.
    pub fn resolve_base(&self) -> Result<Option<BaseVfs>> {
        self.base
            .as_ref()
            .map(|_| BaseVfs::find(self.base_name()))
            .transpose()
    }
}
