use std::path::{Path, PathBuf};

pub const NB_HOME_DIR_NAME: &str = ".nano-banana";
pub const PROJECT_SETTINGS_REL_PATH: &str = ".nano-banana/settings.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NbHome {
    pub root: PathBuf,
}

impl NbHome {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_user_home() -> Self {
        Self::resolve(dirs::home_dir().as_deref())
    }

    pub fn resolve(home: Option<&Path>) -> Self {
        let root = home
            .map(|dir| dir.join(NB_HOME_DIR_NAME))
            .unwrap_or_else(|| PathBuf::from(NB_HOME_DIR_NAME));
        Self { root }
    }

    pub fn costs_file(&self) -> PathBuf {
        self.root.join("costs.json")
    }

    pub fn env_file(&self) -> PathBuf {
        self.root.join(".env")
    }

    pub fn settings_toml(&self) -> PathBuf {
        self.root.join("settings.toml")
    }

    pub fn settings_json(&self) -> PathBuf {
        self.root.join("settings.json")
    }
}
